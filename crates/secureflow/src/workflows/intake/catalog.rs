use std::collections::HashSet;

use super::domain::{DocumentRequirement, RequirementId};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("requirement '{0}' is declared more than once")]
    DuplicateRequirement(RequirementId),
}

/// Fixed set of documents the workflow collects, defined once at process start.
#[derive(Debug, Clone)]
pub struct RequirementCatalog {
    requirements: Vec<DocumentRequirement>,
}

impl RequirementCatalog {
    pub fn new(requirements: Vec<DocumentRequirement>) -> Result<Self, CatalogError> {
        let mut seen = HashSet::new();
        for requirement in &requirements {
            if !seen.insert(requirement.id.clone()) {
                return Err(CatalogError::DuplicateRequirement(requirement.id.clone()));
            }
        }
        Ok(Self { requirements })
    }

    pub fn standard() -> Self {
        Self {
            requirements: standard_requirements(),
        }
    }

    pub fn requirements(&self) -> &[DocumentRequirement] {
        &self.requirements
    }

    pub fn get(&self, id: &RequirementId) -> Option<&DocumentRequirement> {
        self.requirements.iter().find(|requirement| &requirement.id == id)
    }

    pub fn required(&self) -> impl Iterator<Item = &DocumentRequirement> {
        self.requirements.iter().filter(|requirement| requirement.required)
    }
}

impl Default for RequirementCatalog {
    fn default() -> Self {
        Self::standard()
    }
}

fn requirement(id: &str, display_name: &str, description: &str) -> DocumentRequirement {
    DocumentRequirement {
        id: RequirementId::new(id),
        display_name: display_name.to_string(),
        description: description.to_string(),
        required: true,
    }
}

fn standard_requirements() -> Vec<DocumentRequirement> {
    vec![
        requirement(
            "proof-id",
            "Proof of ID",
            "Driver's license, passport, or state ID",
        ),
        requirement(
            "proof-address",
            "Proof of Address",
            "Utility bill or bank statement (last 3 months)",
        ),
        requirement(
            "bank-statement",
            "Bank Statement",
            "Most recent bank statement showing payment",
        ),
        requirement(
            "written-summary",
            "Written Summary",
            "Brief description of your situation",
        ),
        requirement(
            "authorization",
            "Authorization Form",
            "Signed authorization document",
        ),
    ]
}
