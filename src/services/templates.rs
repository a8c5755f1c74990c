use std::collections::HashMap;

use regex::Regex;
use thiserror::Error;

use crate::models::Template;

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("unknown template '{0}'")]
    NotFound(String),

    #[error("missing value for template variable '{0}'")]
    MissingVariable(String),

    #[error("unknown template variable '{0}'")]
    UnknownVariable(String),
}

/// A template with its variables substituted, ready to run.
#[derive(Debug, Clone)]
pub struct RenderedTemplate {
    pub title: String,
    pub prompts: Vec<String>,
}

/// Look a template up by its alias first, then by its title. Matching is
/// case-sensitive and exact.
pub fn resolve<'a>(templates: &'a [Template], name: &str) -> Result<&'a Template, TemplateError> {
    templates
        .iter()
        .find(|t| t.name.as_deref() == Some(name))
        .or_else(|| templates.iter().find(|t| t.title == name))
        .ok_or_else(|| TemplateError::NotFound(name.to_string()))
}

/// Validate the supplied variable values against the template's declared
/// variables and substitute them into the title and prompts. Values land
/// literally; a value containing `{{other}}` is not expanded again.
pub fn bind(
    template: &Template,
    variables: &HashMap<String, String>,
) -> Result<RenderedTemplate, TemplateError> {
    for declared in &template.variables {
        if !variables.contains_key(&declared.name) {
            return Err(TemplateError::MissingVariable(declared.name.clone()));
        }
    }

    let mut unknown: Vec<&String> = variables
        .keys()
        .filter(|key| !template.variables.iter().any(|v| &v.name == *key))
        .collect();
    unknown.sort();
    if let Some(key) = unknown.first() {
        return Err(TemplateError::UnknownVariable((*key).clone()));
    }

    if template.variables.is_empty() {
        return Ok(RenderedTemplate {
            title: template.title.clone(),
            prompts: template.prompts.clone(),
        });
    }

    let alternation = template
        .variables
        .iter()
        .map(|v| regex::escape(&v.name))
        .collect::<Vec<_>>()
        .join("|");
    let pattern = format!(r"\{{\{{({alternation})\}}\}}");
    let re = Regex::new(&pattern).expect("variable pattern compiles");

    Ok(RenderedTemplate {
        title: substitute(&re, variables, &template.title),
        prompts: template
            .prompts
            .iter()
            .map(|p| substitute(&re, variables, p))
            .collect(),
    })
}

/// One replacement pass; values are inserted verbatim, never re-scanned.
fn substitute(re: &Regex, variables: &HashMap<String, String>, text: &str) -> String {
    re.replace_all(text, |caps: &regex::Captures| variables[&caps[1]].clone())
        .into_owned()
}
