//! Prompt template parsing and rendering.
//!
//! Supports `{name}` placeholders with `{{` and `}}` escaping to literal
//! braces. Templates are parsed once and rendered many times against a map
//! of values.

use crate::types::{ChatMessage, Role};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("missing required variable: {name}")]
    MissingVariable { name: String },

    #[error("invalid placeholder: {{{name}}}")]
    InvalidPlaceholder { name: String },

    #[error("unclosed placeholder starting at offset {offset}")]
    UnclosedPlaceholder { offset: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Variable(String),
}

/// A parsed prompt template.
#[derive(Debug, Clone)]
pub struct PromptTemplate {
    content: String,
    segments: Vec<Segment>,
    variables: Vec<String>,
}

impl PromptTemplate {
    /// Parse a template string, extracting `{name}` placeholders.
    ///
    /// Placeholder names are ASCII alphanumerics and underscores. `{{` and
    /// `}}` produce literal braces.
    pub fn parse(content: impl Into<String>) -> Result<Self, TemplateError> {
        let content = content.into();
        let mut segments = Vec::new();
        let mut variables = Vec::new();
        let mut literal = String::new();

        let bytes = content.as_bytes();
        let mut i = 0;
        while i < bytes.len() {
            match bytes[i] {
                b'{' if bytes.get(i + 1) == Some(&b'{') => {
                    literal.push('{');
                    i += 2;
                }
                b'}' if bytes.get(i + 1) == Some(&b'}') => {
                    literal.push('}');
                    i += 2;
                }
                b'{' => {
                    let Some(rel) = content[i + 1..].find('}') else {
                        return Err(TemplateError::UnclosedPlaceholder { offset: i });
                    };
                    let name = &content[i + 1..i + 1 + rel];
                    if name.is_empty()
                        || !name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
                    {
                        return Err(TemplateError::InvalidPlaceholder {
                            name: name.to_string(),
                        });
                    }
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    if !variables.iter().any(|v| v == name) {
                        variables.push(name.to_string());
                    }
                    segments.push(Segment::Variable(name.to_string()));
                    i += rel + 2;
                }
                b => {
                    // Multi-byte chars are copied through via the literal path.
                    let ch_len = utf8_len(b);
                    literal.push_str(&content[i..i + ch_len]);
                    i += ch_len;
                }
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self {
            content,
            segments,
            variables,
        })
    }

    /// The original template text.
    pub fn content(&self) -> &str {
        &self.content
    }

    /// Placeholder names in first-appearance order, deduplicated.
    pub fn variables(&self) -> &[String] {
        &self.variables
    }

    pub fn has_variables(&self) -> bool {
        !self.variables.is_empty()
    }

    /// Render the template with the provided values.
    pub fn render(&self, values: &HashMap<String, String>) -> Result<String, TemplateError> {
        let mut out = String::with_capacity(self.content.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Variable(name) => match values.get(name) {
                    Some(v) => out.push_str(v),
                    None => {
                        return Err(TemplateError::MissingVariable { name: name.clone() });
                    }
                },
            }
        }
        Ok(out)
    }
}

fn utf8_len(first_byte: u8) -> usize {
    match first_byte {
        b if b < 0x80 => 1,
        b if b >> 5 == 0b110 => 2,
        b if b >> 4 == 0b1110 => 3,
        _ => 4,
    }
}

/// An ordered list of role-tagged templates rendered into a chat message
/// list, e.g. a system preamble followed by a templated user turn.
#[derive(Debug, Clone)]
pub struct ChatTemplate {
    messages: Vec<(Role, PromptTemplate)>,
}

impl ChatTemplate {
    pub fn from_messages<S: AsRef<str>>(
        messages: &[(Role, S)],
    ) -> Result<Self, TemplateError> {
        let messages = messages
            .iter()
            .map(|(role, text)| Ok((*role, PromptTemplate::parse(text.as_ref())?)))
            .collect::<Result<Vec<_>, TemplateError>>()?;
        Ok(Self { messages })
    }

    /// Placeholder names across all member templates, deduplicated.
    pub fn variables(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        for (_, template) in &self.messages {
            for name in template.variables() {
                if !out.contains(&name.as_str()) {
                    out.push(name);
                }
            }
        }
        out
    }

    pub fn render(
        &self,
        values: &HashMap<String, String>,
    ) -> Result<Vec<ChatMessage>, TemplateError> {
        self.messages
            .iter()
            .map(|(role, template)| {
                Ok(ChatMessage {
                    role: *role,
                    content: template.render(values)?,
                })
            })
            .collect()
    }
}

/// Few-shot prompt assembly: a prefix, one template applied to each example
/// value map, and a suffix rendered with the final input values.
#[derive(Debug, Clone)]
pub struct FewShotTemplate {
    prefix: String,
    example: PromptTemplate,
    examples: Vec<HashMap<String, String>>,
    suffix: PromptTemplate,
}

impl FewShotTemplate {
    pub fn new(
        prefix: impl Into<String>,
        example: PromptTemplate,
        suffix: PromptTemplate,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            example,
            examples: Vec::new(),
            suffix,
        }
    }

    pub fn with_example(mut self, values: HashMap<String, String>) -> Self {
        self.examples.push(values);
        self
    }

    pub fn render(&self, values: &HashMap<String, String>) -> Result<String, TemplateError> {
        let mut parts = Vec::with_capacity(self.examples.len() + 2);
        if !self.prefix.is_empty() {
            parts.push(self.prefix.clone());
        }
        for example in &self.examples {
            parts.push(self.example.render(example)?);
        }
        parts.push(self.suffix.render(values)?);
        Ok(parts.join("\n\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn plain_text_has_no_variables() {
        let template = PromptTemplate::parse("Hello, world!").unwrap();
        assert!(!template.has_variables());
        assert_eq!(template.render(&HashMap::new()).unwrap(), "Hello, world!");
    }

    #[test]
    fn renders_a_single_variable() {
        let template = PromptTemplate::parse("Hello, {name}!").unwrap();
        assert_eq!(template.variables(), ["name"]);
        let result = template.render(&values(&[("name", "Alice")])).unwrap();
        assert_eq!(result, "Hello, Alice!");
    }

    #[test]
    fn repeated_variable_is_listed_once_and_rendered_everywhere() {
        let template = PromptTemplate::parse("{name} and {name} again").unwrap();
        assert_eq!(template.variables(), ["name"]);
        let result = template.render(&values(&[("name", "x")])).unwrap();
        assert_eq!(result, "x and x again");
    }

    #[test]
    fn missing_variable_is_an_error() {
        let template = PromptTemplate::parse("Explain {topic} to {audience}.").unwrap();
        let err = template
            .render(&values(&[("topic", "ownership")]))
            .expect_err("audience unset");
        assert_eq!(
            err,
            TemplateError::MissingVariable {
                name: "audience".to_string()
            }
        );
    }

    #[test]
    fn doubled_braces_escape_to_literals() {
        let template = PromptTemplate::parse("json: {{\"k\": \"{v}\"}}").unwrap();
        assert_eq!(template.variables(), ["v"]);
        let result = template.render(&values(&[("v", "1")])).unwrap();
        assert_eq!(result, "json: {\"k\": \"1\"}");
    }

    #[test]
    fn unclosed_placeholder_is_rejected() {
        let err = PromptTemplate::parse("Hello {name").expect_err("unclosed");
        assert!(matches!(err, TemplateError::UnclosedPlaceholder { offset: 6 }));
    }

    #[test]
    fn placeholder_with_invalid_characters_is_rejected() {
        let err = PromptTemplate::parse("Hello {first name}").expect_err("space in name");
        assert!(matches!(err, TemplateError::InvalidPlaceholder { .. }));
        let err = PromptTemplate::parse("empty {} braces").expect_err("empty name");
        assert!(matches!(err, TemplateError::InvalidPlaceholder { .. }));
    }

    #[test]
    fn non_ascii_literals_pass_through() {
        let template = PromptTemplate::parse("héllo {name} → done").unwrap();
        let result = template.render(&values(&[("name", "wörld")])).unwrap();
        assert_eq!(result, "héllo wörld → done");
    }

    #[test]
    fn chat_template_renders_role_tagged_messages() {
        let template = ChatTemplate::from_messages(&[
            (Role::System, "You explain {subject} clearly."),
            (Role::User, "{question}"),
        ])
        .unwrap();
        assert_eq!(template.variables(), ["subject", "question"]);

        let messages = template
            .render(&values(&[
                ("subject", "machine learning"),
                ("question", "What is overfitting?"),
            ]))
            .unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[0].content, "You explain machine learning clearly.");
        assert_eq!(messages[1].role, Role::User);
        assert_eq!(messages[1].content, "What is overfitting?");
    }

    #[test]
    fn chat_template_propagates_missing_variables() {
        let template =
            ChatTemplate::from_messages(&[(Role::User, "{question}")]).unwrap();
        let err = template.render(&HashMap::new()).expect_err("no question");
        assert!(matches!(err, TemplateError::MissingVariable { .. }));
    }

    #[test]
    fn few_shot_template_assembles_prefix_examples_and_suffix() {
        let example = PromptTemplate::parse("Language: {input}\nDescription: {output}").unwrap();
        let suffix = PromptTemplate::parse("Language: {input}\nDescription:").unwrap();
        let few_shot = FewShotTemplate::new("Describe programming languages:", example, suffix)
            .with_example(values(&[("input", "Python"), ("output", "dynamic and friendly")]))
            .with_example(values(&[("input", "Rust"), ("output", "fast and safe")]));

        let prompt = few_shot.render(&values(&[("input", "Go")])).unwrap();
        assert_eq!(
            prompt,
            "Describe programming languages:\n\n\
             Language: Python\nDescription: dynamic and friendly\n\n\
             Language: Rust\nDescription: fast and safe\n\n\
             Language: Go\nDescription:"
        );
    }

    #[test]
    fn few_shot_example_with_missing_value_is_an_error() {
        let example = PromptTemplate::parse("{input}: {output}").unwrap();
        let suffix = PromptTemplate::parse("{input}:").unwrap();
        let few_shot = FewShotTemplate::new("", example, suffix)
            .with_example(values(&[("input", "a")]));
        let err = few_shot.render(&values(&[("input", "b")])).expect_err("output unset");
        assert!(matches!(err, TemplateError::MissingVariable { .. }));
    }
}
