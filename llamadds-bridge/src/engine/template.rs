//! Chat-template application.
//!
//! Models that ship a template get it applied through minijinja with the
//! conventional `messages` / `add_generation_prompt` context. When no
//! template is registered the bridge uses [`fallback_prompt`], a generic
//! role-tagged wrapper that closes with an assistant opener.

use llamadds::ChatMessage;
use minijinja::Environment;

use super::EngineError;

pub struct ChatTemplate {
    env: Environment<'static>,
}

impl ChatTemplate {
    pub fn new(source: &str) -> Result<Self, EngineError> {
        let mut env = Environment::new();
        env.add_template_owned("chat", source.to_string())
            .map_err(|e| EngineError::Template {
                reason: e.to_string(),
            })?;
        Ok(Self { env })
    }

    /// Render the flat prompt for a message list.
    pub fn apply(
        &self,
        messages: &[ChatMessage],
        add_generation_prompt: bool,
    ) -> Result<String, EngineError> {
        let tmpl = self.env.get_template("chat").map_err(|e| EngineError::Template {
            reason: e.to_string(),
        })?;
        let msgs: Vec<minijinja::Value> = messages
            .iter()
            .map(|m| minijinja::context! { role => m.role.as_str(), content => m.content.as_str() })
            .collect();
        tmpl.render(minijinja::context! {
            messages => msgs,
            add_generation_prompt => add_generation_prompt,
        })
        .map_err(|e| EngineError::Template {
            reason: e.to_string(),
        })
    }
}

/// Role-tagged fallback applied when no model template is available.
pub fn fallback_prompt(messages: &[ChatMessage]) -> String {
    let mut prompt = String::new();
    for msg in messages {
        prompt.push_str(&format!("<|{}|>\n{}<|end|>\n", msg.role, msg.content));
    }
    prompt.push_str("<|assistant|>\n");
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use llamadds::Role;

    #[test]
    fn fallback_wraps_roles_and_opens_assistant_turn() {
        let messages = vec![
            ChatMessage::new(Role::System, "Be brief."),
            ChatMessage::new(Role::User, "What is 2+2?"),
        ];
        let prompt = fallback_prompt(&messages);
        assert_eq!(
            prompt,
            "<|system|>\nBe brief.<|end|>\n<|user|>\nWhat is 2+2?<|end|>\n<|assistant|>\n"
        );
    }

    #[test]
    fn template_renders_messages() {
        let tmpl = ChatTemplate::new(
            "{% for m in messages %}[{{ m.role }}] {{ m.content }}\n{% endfor %}\
             {% if add_generation_prompt %}[assistant] {% endif %}",
        )
        .unwrap();
        let messages = vec![ChatMessage::new(Role::User, "hello")];
        let prompt = tmpl.apply(&messages, true).unwrap();
        assert_eq!(prompt, "[user] hello\n[assistant] ");
    }

    #[test]
    fn broken_template_is_an_error() {
        assert!(ChatTemplate::new("{% for m in %}").is_err());
    }
}
