// SPDX-License-Identifier: MIT OR Apache-2.0

//! Conversation templates used by InternVL chat checkpoints.
//!
//! All supported templates share the MPT separator style: the system block
//! and every filled turn are followed by the separator, and an empty turn
//! leaves only its role marker so generation continues from there.

use crate::error::{LensError, Result};

/// System message of the `internvl2_5` template.
const INTERNVL2_5_SYSTEM: &str = "你是书生·万象，英文名是InternVL，是由上海人工智能实验室、\
                                  清华大学及多家合作单位联合开发的多模态大语言模型。";

/// System message shared by the `Hermes-2` and `internlm2-chat` templates.
const INTERNVL2_SYSTEM: &str = "你是由上海人工智能实验室联合商汤科技开发的书生多模态大模型，\
                                英文名叫InternVL, 是一个有用无害的人工智能助手。";

/// A named chat template with its turn buffer.
///
/// ```
/// use candle_vlm_lens::ConversationTemplate;
///
/// let mut conv = ConversationTemplate::lookup("internvl2_5").unwrap();
/// conv.append_user("Describe the image.");
/// conv.append_assistant(None);
/// let prompt = conv.prompt();
/// assert!(prompt.ends_with("<|im_start|>assistant\n"));
/// assert_eq!(conv.stop_str(), "<|im_end|>");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationTemplate {
    /// Template name as it appears in `config.json`.
    name: &'static str,
    /// System block; `{system_message}` is substituted.
    system_template: &'static str,
    /// Default system message.
    system_message: String,
    /// User and assistant role markers.
    roles: [&'static str; 2],
    /// Separator appended after the system block and every filled turn.
    sep: &'static str,
    /// Turns appended so far: role marker and optional message.
    messages: Vec<(&'static str, Option<String>)>,
}

impl ConversationTemplate {
    /// Names accepted by [`lookup`](Self::lookup).
    pub const NAMES: [&'static str; 4] = ["internvl2_5", "Hermes-2", "internlm2-chat", "phi3-chat"];

    /// Look up a template by name.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Config`] for unknown names.
    pub fn lookup(name: &str) -> Result<Self> {
        let (name, system_template, system_message, roles, sep) = match name {
            "internvl2_5" => (
                "internvl2_5",
                "<|im_start|>system\n{system_message}",
                INTERNVL2_5_SYSTEM,
                ["<|im_start|>user\n", "<|im_start|>assistant\n"],
                "<|im_end|>\n",
            ),
            "Hermes-2" => (
                "Hermes-2",
                "<|im_start|>system\n{system_message}",
                INTERNVL2_SYSTEM,
                ["<|im_start|>user\n", "<|im_start|>assistant\n"],
                "<|im_end|>",
            ),
            "internlm2-chat" => (
                "internlm2-chat",
                "<|im_start|>system\n{system_message}",
                INTERNVL2_SYSTEM,
                ["<|im_start|>user\n", "<|im_start|>assistant\n"],
                "<|im_end|>",
            ),
            "phi3-chat" => (
                "phi3-chat",
                "<|system|>\n{system_message}",
                INTERNVL2_SYSTEM,
                ["<|user|>\n", "<|assistant|>\n"],
                "<|end|>",
            ),
            other => {
                return Err(LensError::Config(format!(
                    "unknown conversation template '{other}' (known: {})",
                    Self::NAMES.join(", ")
                )));
            }
        };
        Ok(Self {
            name,
            system_template,
            system_message: system_message.to_owned(),
            roles,
            sep,
            messages: Vec::new(),
        })
    }

    /// Template name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Replace the system message.
    pub fn set_system_message(&mut self, message: impl Into<String>) {
        self.system_message = message.into();
    }

    /// User and assistant role markers.
    #[must_use]
    pub const fn roles(&self) -> [&'static str; 2] {
        self.roles
    }

    /// Raw separator string.
    #[must_use]
    pub const fn separator(&self) -> &'static str {
        self.sep
    }

    /// Generation stop marker: the separator without surrounding whitespace.
    #[must_use]
    pub fn stop_str(&self) -> &'static str {
        self.sep.trim()
    }

    /// Append a user turn.
    pub fn append_user(&mut self, message: impl Into<String>) {
        self.messages.push((self.roles[0], Some(message.into())));
    }

    /// Append an assistant turn; `None` leaves the response slot open.
    pub fn append_assistant(&mut self, message: Option<String>) {
        self.messages.push((self.roles[1], message));
    }

    /// Render the conversation into a single prompt string.
    #[must_use]
    pub fn prompt(&self) -> String {
        let mut out = self
            .system_template
            .replace("{system_message}", &self.system_message);
        out.push_str(self.sep);
        for (role, message) in &self.messages {
            out.push_str(role);
            if let Some(message) = message.as_deref().filter(|m| !m.is_empty()) {
                out.push_str(message);
                out.push_str(self.sep);
            }
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
