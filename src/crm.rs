//! Customer records, keyword-ranked product recommendations, and the
//! AI-written post-call summary that lands in the summaries table.

use crate::classify::{extract_json_object, TranscriptionClassifier};
use crate::log_debug;
use crate::sink::ResultSink;
use anyhow::Result;

pub const CRM_HEADERS: [&str; 8] = [
    "CustomerName",
    "Company",
    "Industry",
    "Budget",
    "InterestLevel",
    "Email",
    "Phone",
    "RecommendedProducts",
];

pub const SUMMARY_HEADERS: [&str; 6] = [
    "Timestamp",
    "CustomerName",
    "Summary",
    "ActionItems",
    "Sentiment",
    "Emotion",
];

const ACTION_ITEMS_MAX_CHARS: usize = 400;
/// Products carrying one of these markers are the gentler pitch for an
/// unhappy caller.
const SOFT_PRODUCT_MARKERS: [&str; 4] = ["trial", "demo", "lite", "basic"];

/// One CRM row, keyed by email for lookups.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CustomerRecord {
    pub name: String,
    pub company: String,
    pub industry: String,
    pub budget: String,
    pub interest_level: String,
    pub email: String,
    pub phone: String,
    pub recommended_products: String,
}

impl CustomerRecord {
    fn from_row(row: &[String]) -> Self {
        let cell = |i: usize| row.get(i).cloned().unwrap_or_default();
        Self {
            name: cell(0),
            company: cell(1),
            industry: cell(2),
            budget: cell(3),
            interest_level: cell(4),
            email: cell(5),
            phone: cell(6),
            recommended_products: cell(7),
        }
    }

    fn to_row(&self) -> Vec<String> {
        vec![
            self.name.clone(),
            self.company.clone(),
            self.industry.clone(),
            self.budget.clone(),
            self.interest_level.clone(),
            self.email.clone(),
            self.phone.clone(),
            self.recommended_products.clone(),
        ]
    }

    /// Dropdown label: "Name — Company" when a company is on file.
    pub fn display_label(&self) -> String {
        if self.company.is_empty() {
            self.name.clone()
        } else {
            format!("{} — {}", self.name, self.company)
        }
    }
}

/// Load every customer from the CRM table, ensuring its header first.
pub fn load_customers(sink: &dyn ResultSink) -> Result<Vec<CustomerRecord>> {
    sink.ensure_header_row(&CRM_HEADERS)?;
    Ok(crate::sink::data_rows(sink)?
        .iter()
        .filter(|row| row.iter().any(|cell| !cell.is_empty()))
        .map(|row| CustomerRecord::from_row(row))
        .collect())
}

pub fn find_by_email<'a>(
    customers: &'a [CustomerRecord],
    email: &str,
) -> Option<&'a CustomerRecord> {
    if email.is_empty() {
        return None;
    }
    customers.iter().find(|c| c.email == email)
}

/// Split a comma-separated product cell, trimming entries and dropping
/// case-insensitive duplicates while preserving first-seen order.
pub fn parse_products(cell: &str) -> Vec<String> {
    let mut seen = Vec::new();
    let mut out = Vec::new();
    for part in cell.split(',') {
        let trimmed = part.trim();
        if trimmed.is_empty() {
            continue;
        }
        let lowered = trimmed.to_lowercase();
        if !seen.contains(&lowered) {
            seen.push(lowered);
            out.push(trimmed.to_string());
        }
    }
    out
}

/// Rank products for the current sentiment. A negative read moves the softer
/// offerings (trial/demo/lite/basic) to the front; anything else leaves the
/// CRM order untouched.
pub fn rank_products(products: &[String], sentiment: &str) -> Vec<String> {
    if products.is_empty() || !sentiment.to_lowercase().contains("neg") {
        return products.to_vec();
    }

    let mut soft = Vec::new();
    let mut hard = Vec::new();
    for product in products {
        let lowered = product.to_lowercase();
        if SOFT_PRODUCT_MARKERS.iter().any(|m| lowered.contains(m)) {
            soft.push(product.clone());
        } else {
            hard.push(product.clone());
        }
    }
    if soft.is_empty() {
        return products.to_vec();
    }
    soft.extend(hard);
    soft
}

/// Post-call summary plus flattened action items.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSummary {
    pub summary: String,
    pub action_items: String,
}

const SUMMARY_SYSTEM_INSTRUCTION: &str = "You are a sales assistant. Write a concise post-call \
summary and clear action items.\n\
- Keep summary <= 120 words.\n\
- Use simple bullet points in Action Items (2-4 items).\n\
- Avoid guessing unknown details.\n\
Return JSON only, with keys 'summary' and 'action_items' (list of strings).";

/// Ask the language model for a post-call summary. Empty transcripts
/// short-circuit without a network call; unparseable replies fall back to a
/// fixed payload; request faults degrade to an error-tagged summary so the
/// save flow never aborts.
pub fn generate_call_summary(
    classifier: &dyn TranscriptionClassifier,
    transcript: &str,
    customer: Option<&CustomerRecord>,
    sentiment: &str,
    emotion: &str,
) -> CallSummary {
    if transcript.trim().is_empty() {
        return CallSummary {
            summary: "Not speaking. No summary generated.".to_string(),
            action_items: String::new(),
        };
    }

    let (name, industry) = customer
        .map(|c| (c.name.as_str(), c.industry.as_str()))
        .unwrap_or(("", ""));
    let prompt = format!(
        "Customer: {name}\nIndustry: {industry}\nSentiment: {sentiment}\nEmotion: {emotion}\n\
         Transcript:\n{transcript}\n\n\
         Return JSON with keys 'summary' and 'action_items' (list of strings)."
    );

    let reply = match classifier.classify(&prompt, &[], SUMMARY_SYSTEM_INSTRUCTION) {
        Ok(reply) => reply,
        Err(err) => {
            log_debug(&format!("summary generation failed: {err:#}"));
            return CallSummary {
                summary: format!("[summary error: {err:#}]").replace('\n', " "),
                action_items: String::new(),
            };
        }
    };

    parse_summary_reply(&reply)
}

/// Tolerant decode of the model's reply: strict JSON, then the first
/// brace-delimited region, then a fixed fallback payload.
fn parse_summary_reply(reply: &str) -> CallSummary {
    let Some(value) = extract_json_object(reply) else {
        return CallSummary {
            summary: "Summary unavailable.".to_string(),
            action_items: String::new(),
        };
    };

    let summary = value
        .get("summary")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or("Summary unavailable.")
        .to_string();

    let items: Vec<String> = match value.get("action_items") {
        Some(serde_json::Value::Array(list)) => list
            .iter()
            .map(|item| match item {
                serde_json::Value::String(s) => s.trim().to_string(),
                other => other.to_string(),
            })
            .filter(|s| !s.is_empty())
            .collect(),
        Some(serde_json::Value::String(s)) if !s.trim().is_empty() => {
            vec![s.trim().to_string()]
        }
        _ => Vec::new(),
    };

    CallSummary {
        summary,
        action_items: truncate_chars(&items.join("; "), ACTION_ITEMS_MAX_CHARS),
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// Append one finished summary to the summaries table.
pub fn save_summary_row(
    sink: &dyn ResultSink,
    timestamp: &str,
    customer: Option<&CustomerRecord>,
    summary: &CallSummary,
    sentiment: &str,
    emotion: &str,
) -> Result<()> {
    sink.ensure_header_row(&SUMMARY_HEADERS)?;
    sink.append_row(&[
        timestamp.to_string(),
        customer.map(|c| c.name.clone()).unwrap_or_default(),
        summary.summary.clone(),
        summary.action_items.clone(),
        sentiment.to_string(),
        emotion.to_string(),
    ])
}

/// Fill an empty CRM table with a handful of demo customers so the dashboard
/// has something to recommend against. Leaves a populated table alone.
pub fn seed_demo_customers(sink: &dyn ResultSink) -> Result<usize> {
    let existing = load_customers(sink)?;
    if !existing.is_empty() {
        return Ok(0);
    }

    let demo = [
        CustomerRecord {
            name: "Aisha Patel".into(),
            company: "NovaTech Systems".into(),
            industry: "Technology".into(),
            budget: "24000".into(),
            interest_level: "High".into(),
            email: "aisha.patel@novatech.example".into(),
            phone: "+91-9801001000".into(),
            recommended_products: "CRM Suite, Analytics Dashboard".into(),
        },
        CustomerRecord {
            name: "David Rodrigues".into(),
            company: "GreenMart Retail".into(),
            industry: "Retail".into(),
            budget: "18000".into(),
            interest_level: "Medium".into(),
            email: "david.rod@greenmart.example".into(),
            phone: "+91-9802002000".into(),
            recommended_products: "POS System, Loyalty App, POS Starter Trial".into(),
        },
        CustomerRecord {
            name: "Priya Deshmukh".into(),
            company: "MediCare Hospitals".into(),
            industry: "Healthcare".into(),
            budget: "30000".into(),
            interest_level: "High".into(),
            email: "priya.desh@medicare.example".into(),
            phone: "+91-9803003000".into(),
            recommended_products: "Telehealth Platform, Patient CRM".into(),
        },
        CustomerRecord {
            name: "Liam Sharma".into(),
            company: "EduSpark Learning".into(),
            industry: "Education".into(),
            budget: "15000".into(),
            interest_level: "Medium".into(),
            email: "liam.sharma@eduspark.example".into(),
            phone: "+91-9804004000".into(),
            recommended_products: "LMS Platform, Online Classrooms, Classroom Demo".into(),
        },
        CustomerRecord {
            name: "Kavya Menon".into(),
            company: "AutoWorks Manufacturing".into(),
            industry: "Manufacturing".into(),
            budget: "22000".into(),
            interest_level: "High".into(),
            email: "kavya.menon@autoworks.example".into(),
            phone: "+91-9805005000".into(),
            recommended_products: "ERP Suite, Predictive Maintenance".into(),
        },
    ];

    for customer in &demo {
        sink.append_row(&customer.to_row())?;
    }
    Ok(demo.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;
    use anyhow::anyhow;

    struct CannedClassifier {
        reply: Result<&'static str, &'static str>,
    }

    impl TranscriptionClassifier for CannedClassifier {
        fn transcribe(&self, _wav: &[u8]) -> Result<String> {
            Err(anyhow!("not used in this test"))
        }

        fn classify(&self, _text: &str, _taxonomy: &[&str], _system: &str) -> Result<String> {
            self.reply
                .map(str::to_string)
                .map_err(|e| anyhow!(e.to_string()))
        }
    }

    #[test]
    fn parse_products_dedups_case_insensitively_in_order() {
        let products = parse_products("CRM Suite, crm suite,  Analytics Dashboard , ,CRM SUITE");
        assert_eq!(products, vec!["CRM Suite", "Analytics Dashboard"]);
        assert!(parse_products("").is_empty());
    }

    #[test]
    fn negative_sentiment_front_loads_soft_products() {
        let products = vec![
            "ERP Suite".to_string(),
            "Starter Trial".to_string(),
            "Predictive Maintenance".to_string(),
            "Basic Plan".to_string(),
        ];
        let ranked = rank_products(&products, "Slightly Negative");
        assert_eq!(
            ranked,
            vec!["Starter Trial", "Basic Plan", "ERP Suite", "Predictive Maintenance"]
        );
    }

    #[test]
    fn non_negative_sentiment_keeps_crm_order() {
        let products = vec!["ERP Suite".to_string(), "Starter Trial".to_string()];
        assert_eq!(rank_products(&products, "Positive"), products);
        assert_eq!(rank_products(&products, ""), products);
    }

    #[test]
    fn negative_sentiment_without_soft_products_keeps_order() {
        let products = vec!["ERP Suite".to_string(), "Analytics Dashboard".to_string()];
        assert_eq!(rank_products(&products, "Negative"), products);
    }

    #[test]
    fn summary_short_circuits_on_empty_transcript() {
        let classifier = CannedClassifier {
            reply: Err("must not be called"),
        };
        let summary = generate_call_summary(&classifier, "   ", None, "N/A", "N/A");
        assert_eq!(summary.summary, "Not speaking. No summary generated.");
        assert!(summary.action_items.is_empty());
    }

    #[test]
    fn summary_parses_clean_json_reply() {
        let classifier = CannedClassifier {
            reply: Ok(r#"{"summary":"Good call.","action_items":["send quote","book demo"]}"#),
        };
        let summary =
            generate_call_summary(&classifier, "we talked pricing", None, "Positive", "Joy");
        assert_eq!(summary.summary, "Good call.");
        assert_eq!(summary.action_items, "send quote; book demo");
    }

    #[test]
    fn summary_recovers_json_wrapped_in_prose() {
        let classifier = CannedClassifier {
            reply: Ok("Here you go: {\"summary\": \"Asked about ERP.\", \"action_items\": []} hope that helps"),
        };
        let summary = generate_call_summary(&classifier, "erp chat", None, "Neutral", "Surprise");
        assert_eq!(summary.summary, "Asked about ERP.");
    }

    #[test]
    fn summary_falls_back_on_unparseable_reply() {
        let classifier = CannedClassifier {
            reply: Ok("I cannot produce JSON today."),
        };
        let summary = generate_call_summary(&classifier, "hello there", None, "Neutral", "Joy");
        assert_eq!(summary.summary, "Summary unavailable.");
        assert!(summary.action_items.is_empty());
    }

    #[test]
    fn summary_tags_request_faults() {
        let classifier = CannedClassifier {
            reply: Err("gateway timeout"),
        };
        let summary = generate_call_summary(&classifier, "hello there", None, "Neutral", "Joy");
        assert!(summary.summary.starts_with("[summary error:"));
        assert!(summary.summary.contains("gateway timeout"));
    }

    #[test]
    fn action_items_are_capped() {
        let long_item = "x".repeat(600);
        let reply = format!(r#"{{"summary":"s","action_items":["{long_item}"]}}"#);
        let parsed = parse_summary_reply(&reply);
        assert_eq!(parsed.action_items.chars().count(), ACTION_ITEMS_MAX_CHARS);
    }

    #[test]
    fn crm_round_trip_and_lookup() {
        let sink = MemorySink::new();
        let seeded = seed_demo_customers(&sink).unwrap();
        assert_eq!(seeded, 5);
        // Seeding a populated table is a no-op.
        assert_eq!(seed_demo_customers(&sink).unwrap(), 0);

        let customers = load_customers(&sink).unwrap();
        assert_eq!(customers.len(), 5);
        let hit = find_by_email(&customers, "priya.desh@medicare.example").unwrap();
        assert_eq!(hit.name, "Priya Deshmukh");
        assert_eq!(hit.display_label(), "Priya Deshmukh — MediCare Hospitals");
        assert!(find_by_email(&customers, "").is_none());
        assert!(find_by_email(&customers, "nobody@example.com").is_none());
    }

    #[test]
    fn summary_rows_land_under_their_header() {
        let sink = MemorySink::new();
        let summary = CallSummary {
            summary: "Short call.".into(),
            action_items: "follow up".into(),
        };
        save_summary_row(&sink, "2026-01-02 09:00:00", None, &summary, "Neutral", "Joy").unwrap();

        let rows = sink.rows().unwrap();
        assert_eq!(rows[0], SUMMARY_HEADERS.map(String::from).to_vec());
        assert_eq!(rows[1][2], "Short call.");
    }
}
