use std::collections::HashMap;

use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::{
    error::AppError,
    models::template::{Template, TemplateContent},
};

pub const VERIFICATION_TEMPLATE: &str = "verification";

pub struct TemplateRenderer {
    templates: HashMap<String, Template>,
}

impl Default for TemplateRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateRenderer {
    pub fn new() -> Self {
        let mut templates = HashMap::new();
        templates.insert(
            VERIFICATION_TEMPLATE.to_string(),
            Template {
                name: VERIFICATION_TEMPLATE.to_string(),
                subject: "Verify your email".to_string(),
                body_html: include_str!("../../templates/verification.html").to_string(),
                body_text: include_str!("../../templates/verification.txt").to_string(),
            },
        );

        Self { templates }
    }

    pub fn render(
        &self,
        name: &str,
        variables: &HashMap<String, JsonValue>,
    ) -> Result<TemplateContent, AppError> {
        let template = self
            .templates
            .get(name)
            .ok_or_else(|| AppError::not_found("Template", name))?;

        debug!(
            template = %template.name,
            variable_count = variables.len(),
            "Rendering template"
        );

        Ok(TemplateContent {
            subject: Self::replace_variables(&template.subject, variables, false)?,
            text: Self::replace_variables(&template.body_text, variables, false)?,
            html: Self::replace_variables(&template.body_html, variables, true)?,
        })
    }

    pub fn render_verification(
        &self,
        username: &str,
        verification_link: &str,
    ) -> Result<TemplateContent, AppError> {
        let variables = HashMap::from([
            ("username".to_string(), JsonValue::from(username)),
            ("verificationLink".to_string(), JsonValue::from(verification_link)),
        ]);

        self.render(VERIFICATION_TEMPLATE, &variables)
    }

    /// Plain notifications carry their own subject and body.
    pub fn render_plain(&self, subject: &str, message: &str) -> TemplateContent {
        TemplateContent {
            subject: subject.to_string(),
            text: message.to_string(),
            html: format!("<p>{}</p>", escape_html(message)),
        }
    }

    fn replace_variables(
        template: &str,
        variables: &HashMap<String, JsonValue>,
        html: bool,
    ) -> Result<String, AppError> {
        let mut result = template.to_string();

        for (key, value) in variables {
            let placeholder = format!("{{{{{}}}}}", key);

            let replacement = match value {
                JsonValue::String(s) => s.clone(),
                JsonValue::Number(n) => n.to_string(),
                JsonValue::Bool(b) => b.to_string(),
                JsonValue::Null => String::new(),
                _ => {
                    return Err(AppError::validation(format!(
                        "Unsupported variable type for key '{}'",
                        key
                    )));
                }
            };

            let replacement = if html {
                escape_html(&replacement)
            } else {
                replacement
            };

            result = result.replace(&placeholder, &replacement);
        }

        if let Some(start) = result.find("{{") {
            if let Some(len) = result[start..].find("}}") {
                let missing_var = &result[start..start + len + 2];

                warn!(
                    missing_variable = %missing_var,
                    "Template contains unreplaced variable"
                );

                return Err(AppError::validation(format!(
                    "Missing variable in template: {}",
                    missing_var
                )));
            }
        }

        Ok(result)
    }
}

fn escape_html(input: &str) -> String {
    let mut escaped = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}
