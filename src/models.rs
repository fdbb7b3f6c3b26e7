use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Applied,
    Interviewing,
    Offer,
    Rejected,
}

impl Status {
    /// Forward-only ordering used by reconciliation. Rejected outranks Offer.
    pub fn rank(self) -> u8 {
        match self {
            Status::Applied => 1,
            Status::Interviewing => 2,
            Status::Offer => 3,
            Status::Rejected => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Applied => "Applied",
            Status::Interviewing => "Interviewing",
            Status::Offer => "Offer",
            Status::Rejected => "Rejected",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "applied" => Ok(Status::Applied),
            "interviewing" => Ok(Status::Interviewing),
            "offer" => Ok(Status::Offer),
            "rejected" => Ok(Status::Rejected),
            other => Err(format!("not a tracked status: '{}'", other)),
        }
    }
}

/// One row of the ledger. Field order is the CSV column order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationRecord {
    #[serde(rename = "Company Name")]
    pub company: String,
    #[serde(rename = "Application Date")]
    pub applied_date: NaiveDate,
    #[serde(rename = "Role")]
    pub role: String,
    #[serde(rename = "Status")]
    pub status: Status,
    #[serde(rename = "Notes")]
    pub notes: Option<String>,
}

impl ApplicationRecord {
    pub fn matches(&self, company: &str, role: &str) -> bool {
        same_key(&self.company, company) && same_key(&self.role, role)
    }
}

fn same_key(a: &str, b: &str) -> bool {
    a.to_lowercase() == b.to_lowercase()
}

/// Classifier output. `None` stands for "Unknown".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassifiedEvent {
    pub company: Option<String>,
    pub role: Option<String>,
    pub status: Option<Status>,
}

impl ClassifiedEvent {
    pub fn unknown() -> Self {
        Self::default()
    }

    /// Returns the event as a usable signal if every field is resolved.
    pub fn resolved(&self) -> Option<Signal> {
        match (&self.company, &self.role, self.status) {
            (Some(company), Some(role), Some(status)) => Some(Signal {
                company: company.clone(),
                role: role.clone(),
                status,
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signal {
    pub company: String,
    pub role: String,
    pub status: Status,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Folder {
    Sent,
    Inbox,
}

impl fmt::Display for Folder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Folder::Sent => f.write_str("sent"),
            Folder::Inbox => f.write_str("inbox"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRef {
    pub folder: Folder,
    pub thread_id: String,
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub labels: Vec<String>,
    pub subject: String,
    pub snippet: String,
}

impl MessageRef {
    /// Text handed to the classifier: subject line plus a capped body excerpt.
    pub fn classifier_text(&self, excerpt_chars: usize) -> String {
        let body: String = self.snippet.chars().take(excerpt_chars).collect();
        format!("Subject: {}\nBody: {}", self.subject, body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rank_order_is_literal() {
        assert!(Status::Applied.rank() < Status::Interviewing.rank());
        assert!(Status::Interviewing.rank() < Status::Offer.rank());
        assert!(Status::Offer.rank() < Status::Rejected.rank());
    }

    #[test]
    fn test_status_parse_case_insensitive() {
        assert_eq!("applied".parse::<Status>(), Ok(Status::Applied));
        assert_eq!(" OFFER ".parse::<Status>(), Ok(Status::Offer));
        assert_eq!("Interviewing".parse::<Status>(), Ok(Status::Interviewing));
        assert!("Unknown".parse::<Status>().is_err());
        assert!("".parse::<Status>().is_err());
    }

    #[test]
    fn test_record_matches_ignores_case() {
        let record = ApplicationRecord {
            company: "Acme Inc".to_string(),
            applied_date: NaiveDate::from_ymd_opt(2024, 1, 10).unwrap(),
            role: "SWE".to_string(),
            status: Status::Applied,
            notes: None,
        };
        assert!(record.matches("ACME INC", "swe"));
        assert!(!record.matches("Acme", "SWE"));
    }

    #[test]
    fn test_resolved_requires_all_fields() {
        let mut event = ClassifiedEvent {
            company: Some("Acme".to_string()),
            role: Some("SWE".to_string()),
            status: None,
        };
        assert!(event.resolved().is_none());

        event.status = Some(Status::Offer);
        let signal = event.resolved().unwrap();
        assert_eq!(signal.company, "Acme");
        assert_eq!(signal.status, Status::Offer);

        assert!(ClassifiedEvent::unknown().resolved().is_none());
    }

    #[test]
    fn test_classifier_text_caps_excerpt() {
        let msg = MessageRef {
            folder: Folder::Inbox,
            thread_id: "t1".to_string(),
            id: "m1".to_string(),
            timestamp: Utc::now(),
            labels: vec![],
            subject: "Your application".to_string(),
            snippet: "abcdefghij".to_string(),
        };
        assert_eq!(msg.classifier_text(4), "Subject: Your application\nBody: abcd");
    }
}
