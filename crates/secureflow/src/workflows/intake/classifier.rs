use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::domain::{DocumentRequirement, DocumentUpload, RequirementId};

/// Accept/reject decision for one uploaded file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierVerdict {
    pub accepted: bool,
    pub confidence: f32,
    pub issues: Vec<String>,
}

impl ClassifierVerdict {
    pub fn accepted(confidence: f32) -> Self {
        Self {
            accepted: true,
            confidence,
            issues: Vec::new(),
        }
    }

    pub fn rejected<I, S>(confidence: f32, issues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            accepted: false,
            confidence,
            issues: issues.into_iter().map(Into::into).collect(),
        }
    }

    /// Confidence clamped into `[0, 1]`; NaN collapses to zero.
    pub fn normalized_confidence(&self) -> f32 {
        if self.confidence.is_nan() {
            0.0
        } else {
            self.confidence.clamp(0.0, 1.0)
        }
    }
}

/// Infrastructure failure reaching the classifier. Never a rejection verdict.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClassifierError {
    #[error("classifier unavailable: {0}")]
    Unavailable(String),
    #[error("classifier did not answer within {0:?}")]
    TimedOut(Duration),
}

/// External document verification service (OCR, ML model, manual queue, ...).
#[async_trait]
pub trait DocumentClassifier: Send + Sync {
    async fn classify(
        &self,
        upload: &DocumentUpload,
        requirement: &DocumentRequirement,
    ) -> Result<ClassifierVerdict, ClassifierError>;
}

const ACCEPTED_CONFIDENCE: f32 = 0.9;
const REJECTED_CONFIDENCE: f32 = 0.2;

#[derive(Debug, Clone, Default)]
struct KeywordRule {
    keywords: Vec<String>,
    accept_text_content: bool,
}

/// Deterministic stand-in that accepts a file when its name mentions a keyword
/// registered for the requirement.
#[derive(Debug, Clone, Default)]
pub struct KeywordClassifier {
    rules: HashMap<RequirementId, KeywordRule>,
}

impl KeywordClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rules matching the standard requirement catalog.
    pub fn standard() -> Self {
        Self::new()
            .with_keywords("proof-id", ["id", "license", "passport"])
            .with_keywords("proof-address", ["bill", "statement", "address"])
            .with_keywords("bank-statement", ["bank", "statement"])
            .with_keywords("written-summary", ["summary", "description"])
            .accept_text_content("written-summary")
            .with_keywords("authorization", ["auth", "signed"])
    }

    pub fn with_keywords<I, S>(mut self, requirement: &str, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let rule = self.rules.entry(RequirementId::new(requirement)).or_default();
        rule.keywords.extend(
            keywords
                .into_iter()
                .map(|keyword| keyword.into().to_ascii_lowercase()),
        );
        self
    }

    pub fn accept_text_content(mut self, requirement: &str) -> Self {
        self.rules
            .entry(RequirementId::new(requirement))
            .or_default()
            .accept_text_content = true;
        self
    }

    pub fn verdict(
        &self,
        upload: &DocumentUpload,
        requirement: &DocumentRequirement,
    ) -> ClassifierVerdict {
        if upload.bytes.is_empty() {
            return ClassifierVerdict::rejected(REJECTED_CONFIDENCE, ["file is empty"]);
        }

        let Some(rule) = self.rules.get(&requirement.id) else {
            return ClassifierVerdict::rejected(
                REJECTED_CONFIDENCE,
                [format!("no verification rule for {}", requirement.display_name)],
            );
        };

        let file_name = upload.file_name.to_ascii_lowercase();
        let keyword_match = rule
            .keywords
            .iter()
            .any(|keyword| file_name.contains(keyword.as_str()));
        let text_match = rule.accept_text_content
            && upload
                .content_type
                .as_deref()
                .map(|mime| mime.to_ascii_lowercase().contains("text"))
                .unwrap_or(false);

        if keyword_match || text_match {
            ClassifierVerdict::accepted(ACCEPTED_CONFIDENCE)
        } else {
            ClassifierVerdict::rejected(
                REJECTED_CONFIDENCE,
                [format!(
                    "document does not match the {} requirement",
                    requirement.display_name
                )],
            )
        }
    }
}

#[async_trait]
impl DocumentClassifier for KeywordClassifier {
    async fn classify(
        &self,
        upload: &DocumentUpload,
        requirement: &DocumentRequirement,
    ) -> Result<ClassifierVerdict, ClassifierError> {
        Ok(self.verdict(upload, requirement))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflows::intake::catalog::RequirementCatalog;

    fn requirement(id: &str) -> DocumentRequirement {
        RequirementCatalog::standard()
            .get(&RequirementId::new(id))
            .cloned()
            .expect("standard requirement")
    }

    fn upload(name: &str, content_type: Option<&str>) -> DocumentUpload {
        DocumentUpload::new(name, content_type.map(str::to_string), b"%PDF-1.7".to_vec())
    }

    #[test]
    fn accepts_file_names_carrying_requirement_keywords() {
        let classifier = KeywordClassifier::standard();
        let verdict = classifier.verdict(&upload("Passport-scan.PDF", None), &requirement("proof-id"));
        assert!(verdict.accepted);
        assert!(verdict.issues.is_empty());

        let verdict = classifier.verdict(
            &upload("march-bank.pdf", None),
            &requirement("bank-statement"),
        );
        assert!(verdict.accepted);
    }

    #[test]
    fn rejects_unrelated_files_with_an_issue() {
        let classifier = KeywordClassifier::standard();
        let verdict = classifier.verdict(&upload("selfie.jpg", None), &requirement("authorization"));
        assert!(!verdict.accepted);
        assert_eq!(
            verdict.issues,
            vec!["document does not match the Authorization Form requirement".to_string()]
        );
    }

    #[test]
    fn written_summary_accepts_text_uploads() {
        let classifier = KeywordClassifier::standard();
        let verdict = classifier.verdict(
            &upload("notes.txt", Some("text/plain")),
            &requirement("written-summary"),
        );
        assert!(verdict.accepted);
    }

    #[test]
    fn empty_files_are_rejected() {
        let classifier = KeywordClassifier::standard();
        let empty = DocumentUpload::new("id.pdf", None, Vec::new());
        let verdict = classifier.verdict(&empty, &requirement("proof-id"));
        assert!(!verdict.accepted);
        assert_eq!(verdict.confidence, REJECTED_CONFIDENCE);
        assert_eq!(verdict.issues, vec!["file is empty".to_string()]);
    }

    #[test]
    fn confidence_is_normalized() {
        assert_eq!(ClassifierVerdict::accepted(1.7).normalized_confidence(), 1.0);
        assert_eq!(ClassifierVerdict::accepted(f32::NAN).normalized_confidence(), 0.0);
    }
}
