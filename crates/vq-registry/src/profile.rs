//! Analysis and corrective profile schema: the YAML documents that drive the
//! vision model prompts and parameters for each of the 21 analysis types and
//! each (analysis type, QA tier) corrective pair.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use vq_core::domain::{AnalysisType, QaTier};
use vq_core::template::{
    referenced_placeholders, REQUIRED_ANALYSIS_PLACEHOLDERS, REQUIRED_CORRECTIVE_PLACEHOLDERS,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProfileError {
    #[error("{0}: temperature {1} out of range [0.0, 2.0]")]
    TemperatureOutOfRange(String, f32),
    #[error("{0}: context size {1} out of range [1024, 131072]")]
    ContextSizeOutOfRange(String, u32),
    #[error("{0}: max attempts {1} out of range [1, 5]")]
    MaxAttemptsOutOfRange(String, u32),
    #[error("{0}: missing required field '{1}'")]
    MissingField(String, &'static str),
    #[error("{0}: system prompt template missing required placeholder {{{{{1}}}}}")]
    MissingSystemPlaceholder(String, &'static str),
    #[error("{0}: user prompt template missing required placeholder {{{{{1}}}}}")]
    MissingUserPlaceholder(String, &'static str),
    #[error("{0}: references undeclared placeholder {{{{{1}}}}}")]
    UndeclaredPlaceholder(String, String),
    #[error("{0}: prohibited phrase list is empty")]
    EmptyProhibitedPhrases(String),
    #[error("closed set incomplete: missing analysis profile for type '{0}'")]
    MissingAnalysisType(&'static str),
    #[error("closed set incomplete: missing corrective profile for type '{0}' tier '{1}'")]
    MissingCorrectiveProfile(&'static str, &'static str),
    #[error("yaml parse error in {0}: {1}")]
    Yaml(String, String),
    #[error("io error reading {0}: {1}")]
    Io(String, String),
}

fn default_temperature() -> f32 {
    0.2
}
fn default_context_size() -> u32 {
    8192
}
fn default_max_output_size() -> u32 {
    2048
}
fn default_max_attempts() -> u32 {
    3
}
fn default_confidence_threshold() -> f32 {
    0.8
}

/// An Analysis profile: the prompt pair and output contract for one of the
/// 21 closed analysis types.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisProfile {
    pub analysis_type: AnalysisType,
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_context_size")]
    pub context_size: u32,
    #[serde(default = "default_max_output_size")]
    pub max_output_size: u32,
    pub system_prompt_template: String,
    pub user_prompt_template: String,
    pub output_schema: serde_json::Value,
    #[serde(default)]
    pub prohibited_phrases: Vec<String>,
    /// Extra placeholder names this profile's templates may reference, in
    /// addition to the always-required `IMAGE`.
    #[serde(default)]
    pub declared_placeholders: Vec<String>,
    #[serde(default)]
    pub deadline_secs: Option<u64>,
}

impl AnalysisProfile {
    fn label(&self) -> String {
        format!("analysis/{}", self.analysis_type.slug())
    }

    pub fn validate(&self) -> Result<(), ProfileError> {
        let label = self.label();
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ProfileError::TemperatureOutOfRange(label, self.temperature));
        }
        if !(1024..=131072).contains(&self.context_size) {
            return Err(ProfileError::ContextSizeOutOfRange(label, self.context_size));
        }
        if self.model.trim().is_empty() {
            return Err(ProfileError::MissingField(label, "model"));
        }
        if self.system_prompt_template.trim().is_empty() {
            return Err(ProfileError::MissingField(label, "system_prompt_template"));
        }
        if self.user_prompt_template.trim().is_empty() {
            return Err(ProfileError::MissingField(label, "user_prompt_template"));
        }

        let mut declared: Vec<String> = self.declared_placeholders.clone();
        for name in REQUIRED_ANALYSIS_PLACEHOLDERS {
            if !declared.iter().any(|d| d == name) {
                declared.push((*name).to_string());
            }
        }

        let mut referenced = referenced_placeholders(&self.system_prompt_template);
        referenced.extend(referenced_placeholders(&self.user_prompt_template));
        for r in &referenced {
            if !declared.iter().any(|d| d == r) {
                return Err(ProfileError::UndeclaredPlaceholder(label.clone(), r.clone()));
            }
        }
        if !referenced.iter().any(|r| r == "IMAGE") {
            return Err(ProfileError::MissingUserPlaceholder(label, "IMAGE"));
        }
        Ok(())
    }
}

/// A Corrective profile: the prompt pair used to retry a specific
/// (analysis type, QA tier) pairing after a QA failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrectiveProfile {
    pub analysis_type: AnalysisType,
    pub tier: QaTier,
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_context_size")]
    pub context_size: u32,
    #[serde(default = "default_max_output_size")]
    pub max_output_size: u32,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
    pub system_prompt_template: String,
    pub user_prompt_template: String,
    pub output_schema: serde_json::Value,
    #[serde(default)]
    pub prohibited_phrases: Vec<String>,
    #[serde(default)]
    pub declared_placeholders: Vec<String>,
}

impl CorrectiveProfile {
    fn label(&self) -> String {
        format!("corrective/{}/{}", self.analysis_type.slug(), self.tier.slug())
    }

    pub fn validate(&self) -> Result<(), ProfileError> {
        let label = self.label();
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ProfileError::TemperatureOutOfRange(label, self.temperature));
        }
        if !(1024..=131072).contains(&self.context_size) {
            return Err(ProfileError::ContextSizeOutOfRange(label, self.context_size));
        }
        if !(1..=5).contains(&self.max_attempts) {
            return Err(ProfileError::MaxAttemptsOutOfRange(label, self.max_attempts));
        }
        if self.model.trim().is_empty() {
            return Err(ProfileError::MissingField(label, "model"));
        }
        if self.system_prompt_template.trim().is_empty() {
            return Err(ProfileError::MissingField(label, "system_prompt_template"));
        }
        if self.user_prompt_template.trim().is_empty() {
            return Err(ProfileError::MissingField(label, "user_prompt_template"));
        }
        if self.prohibited_phrases.is_empty() {
            return Err(ProfileError::EmptyProhibitedPhrases(label));
        }

        let mut declared: Vec<String> = self.declared_placeholders.clone();
        for name in REQUIRED_CORRECTIVE_PLACEHOLDERS {
            if !declared.iter().any(|d| d == name) {
                declared.push((*name).to_string());
            }
        }

        let mut referenced = referenced_placeholders(&self.system_prompt_template);
        referenced.extend(referenced_placeholders(&self.user_prompt_template));
        for r in &referenced {
            if !declared.iter().any(|d| d == r) {
                return Err(ProfileError::UndeclaredPlaceholder(label.clone(), r.clone()));
            }
        }
        for required in REQUIRED_CORRECTIVE_PLACEHOLDERS {
            if !referenced.iter().any(|r| r == required) {
                return Err(ProfileError::MissingUserPlaceholder(label, required));
            }
        }
        Ok(())
    }
}

/// A fully loaded and validated set of profiles, keyed for O(1) lookup.
#[derive(Debug, Clone, Default)]
pub struct ProfileSet {
    pub analysis: HashMap<AnalysisType, AnalysisProfile>,
    pub corrective: HashMap<(AnalysisType, QaTier), CorrectiveProfile>,
}

impl ProfileSet {
    /// Parses and validates every YAML document, and checks that every one
    /// of the 21 analysis types in the closed set has a profile.
    pub fn from_documents(
        analysis_docs: Vec<(String, String)>,
        corrective_docs: Vec<(String, String)>,
    ) -> Result<Self, ProfileError> {
        let mut analysis = HashMap::new();
        for (path, text) in analysis_docs {
            let profile: AnalysisProfile = serde_yaml::from_str(&text)
                .map_err(|e| ProfileError::Yaml(path.clone(), e.to_string()))?;
            profile.validate()?;
            analysis.insert(profile.analysis_type, profile);
        }
        for t in AnalysisType::ALL {
            if !analysis.contains_key(&t) {
                return Err(ProfileError::MissingAnalysisType(t.slug()));
            }
        }

        let mut corrective = HashMap::new();
        for (path, text) in corrective_docs {
            let profile: CorrectiveProfile = serde_yaml::from_str(&text)
                .map_err(|e| ProfileError::Yaml(path.clone(), e.to_string()))?;
            profile.validate()?;
            corrective.insert((profile.analysis_type, profile.tier), profile);
        }
        for t in AnalysisType::ALL {
            for tier in QaTier::ORDER {
                if !corrective.contains_key(&(t, tier)) {
                    return Err(ProfileError::MissingCorrectiveProfile(t.slug(), tier.slug()));
                }
            }
        }

        Ok(Self { analysis, corrective })
    }

    pub fn get_analysis(&self, t: AnalysisType) -> Option<&AnalysisProfile> {
        self.analysis.get(&t)
    }

    pub fn get_corrective(&self, t: AnalysisType, tier: QaTier) -> Option<&CorrectiveProfile> {
        self.corrective.get(&(t, tier))
    }
}
