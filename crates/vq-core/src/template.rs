//! Pure placeholder substitution for analysis and corrective prompt templates.
//!
//! Templates use `{{PLACEHOLDER}}` tokens. The set a given template may
//! reference is declared by its profile at load time (spec: "reject unknown
//! placeholders at profile load time, not at render time") — this module
//! only performs the substitution and the declared-set membership check;
//! the registry is responsible for requiring `IMAGE` in every analysis
//! template and `IMAGE`+`PRIOR_OUTPUT` in every corrective template.

use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("unterminated placeholder starting near {{{{{0}")]
    Unterminated(String),
    #[error("undeclared placeholder {{{{{0}}}}} in template")]
    UndeclaredPlaceholder(String),
    #[error("missing binding for placeholder {{{{{0}}}}}")]
    MissingBinding(String),
}

/// Placeholder names a specific profile's templates are permitted to
/// reference, validated at profile load time.
#[derive(Debug, Clone)]
pub struct PlaceholderSet(Vec<String>);

impl PlaceholderSet {
    pub fn from_declared(names: impl IntoIterator<Item = String>) -> Self {
        Self(names.into_iter().collect())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|n| n == name)
    }

    /// Checks every name in `required` is present; used by the registry to
    /// enforce `IMAGE` (analysis + corrective) and `PRIOR_OUTPUT` (corrective).
    pub fn contains_all(&self, required: &[&str]) -> bool {
        required.iter().all(|r| self.contains(r))
    }
}

/// Placeholders every Analysis profile template must declare.
pub const REQUIRED_ANALYSIS_PLACEHOLDERS: &[&str] = &["IMAGE"];

/// Placeholders every Corrective profile template must declare, per spec.md
/// §4.A ("`{{IMAGE}}` and `{{PRIOR_OUTPUT}}` are required in corrective
/// templates").
pub const REQUIRED_CORRECTIVE_PLACEHOLDERS: &[&str] = &["IMAGE", "PRIOR_OUTPUT"];

/// Scans `template` for `{{...}}` tokens and renders them against `bindings`.
///
/// Every token found must be declared in `allowed` (else
/// `UndeclaredPlaceholder`) and bound in `bindings` (else `MissingBinding`).
/// Literal text outside `{{...}}` passes through unchanged.
pub fn render(
    template: &str,
    allowed: &PlaceholderSet,
    bindings: &BTreeMap<&str, String>,
) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or_else(|| TemplateError::Unterminated(after.chars().take(20).collect()))?;
        let name = after[..end].trim();
        if !allowed.contains(name) {
            return Err(TemplateError::UndeclaredPlaceholder(name.to_string()));
        }
        let value = bindings
            .get(name)
            .ok_or_else(|| TemplateError::MissingBinding(name.to_string()))?;
        out.push_str(value);
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Scans `template` for `{{...}}` tokens without rendering — used by the
/// registry at profile load time to determine the declared-placeholder set
/// a template actually references, independent of what it's permitted to.
pub fn referenced_placeholders(template: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else { break };
        out.push(after[..end].trim().to_string());
        rest = &after[end + 2..];
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analysis_set() -> PlaceholderSet {
        PlaceholderSet::from_declared(vec!["IMAGE".to_string(), "MEDIA_ID".to_string()])
    }

    fn corrective_set() -> PlaceholderSet {
        PlaceholderSet::from_declared(vec![
            "IMAGE".to_string(),
            "PRIOR_OUTPUT".to_string(),
            "FAILURE_CATEGORIES".to_string(),
        ])
    }

    #[test]
    fn substitutes_declared_placeholders() {
        let mut bindings = BTreeMap::new();
        bindings.insert("IMAGE", "base64data".to_string());
        bindings.insert("MEDIA_ID", "m-1".to_string());
        let rendered = render("img={{IMAGE}} id={{MEDIA_ID}}", &analysis_set(), &bindings).unwrap();
        assert_eq!(rendered, "img=base64data id=m-1");
    }

    #[test]
    fn rejects_undeclared_placeholder() {
        let bindings = BTreeMap::new();
        let err = render("{{NOT_DECLARED}}", &analysis_set(), &bindings).unwrap_err();
        assert_eq!(err, TemplateError::UndeclaredPlaceholder("NOT_DECLARED".to_string()));
    }

    #[test]
    fn rejects_missing_binding() {
        let bindings = BTreeMap::new();
        let err = render("{{IMAGE}}", &analysis_set(), &bindings).unwrap_err();
        assert_eq!(err, TemplateError::MissingBinding("IMAGE".to_string()));
    }

    #[test]
    fn corrective_template_can_use_prior_output() {
        let mut bindings = BTreeMap::new();
        bindings.insert("IMAGE", "base64data".to_string());
        bindings.insert("PRIOR_OUTPUT", "{}".to_string());
        bindings.insert("FAILURE_CATEGORIES", "meta_descriptive".to_string());
        let rendered = render(
            "prior: {{PRIOR_OUTPUT}} failed: {{FAILURE_CATEGORIES}} img: {{IMAGE}}",
            &corrective_set(),
            &bindings,
        )
        .unwrap();
        assert_eq!(rendered, "prior: {} failed: meta_descriptive img: base64data");
    }

    #[test]
    fn passes_through_literal_text() {
        let bindings = BTreeMap::new();
        let rendered = render("no placeholders here", &analysis_set(), &bindings).unwrap();
        assert_eq!(rendered, "no placeholders here");
    }

    #[test]
    fn referenced_placeholders_lists_all_tokens() {
        let refs = referenced_placeholders("a {{IMAGE}} b {{PRIOR_OUTPUT}} c");
        assert_eq!(refs, vec!["IMAGE".to_string(), "PRIOR_OUTPUT".to_string()]);
    }

    #[test]
    fn required_analysis_placeholders_checked_via_contains_all() {
        assert!(analysis_set().contains_all(REQUIRED_ANALYSIS_PLACEHOLDERS));
        let missing_image = PlaceholderSet::from_declared(vec!["MEDIA_ID".to_string()]);
        assert!(!missing_image.contains_all(REQUIRED_ANALYSIS_PLACEHOLDERS));
    }

    #[test]
    fn required_corrective_placeholders_checked_via_contains_all() {
        assert!(corrective_set().contains_all(REQUIRED_CORRECTIVE_PLACEHOLDERS));
        let missing_prior = PlaceholderSet::from_declared(vec!["IMAGE".to_string()]);
        assert!(!missing_prior.contains_all(REQUIRED_CORRECTIVE_PLACEHOLDERS));
    }
}
