use crate::error::{Error, Result};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use tera::{Context, Tera};

const TEMPLATE_NAME: &str = "prompt";

const LLAMA: &str = "<s>[INST] <<SYS>>\n{{ system }}\n<</SYS>>\n\n{{ instruction }} [/INST]";

const VICUNA: &str = "{{ system }}\nUSER: {{ instruction }}\nASSISTANT:";

const WIZARDLM: &str = "{{ system }}\n\n### Instruction:\n{{ instruction }}\n\n### Response:";

/// Default prompt template per model id (HuggingFace ids).
static BUILTIN: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    [
        ("jondurbin/airoboros-l2-7b-2.2", VICUNA),
        ("jondurbin/airoboros-l2-13b-2.2", VICUNA),
        ("jondurbin/airoboros-c34b-2.2", VICUNA),
        ("meta-llama/Llama-2-7b-hf", LLAMA),
        ("meta-llama/Llama-2-13b-hf", LLAMA),
        ("meta-llama/Llama-2-70b-hf", LLAMA),
        ("meta-llama/Llama-2-7b-chat-hf", LLAMA),
        ("meta-llama/Llama-2-13b-chat-hf", LLAMA),
        ("meta-llama/Llama-2-70b-chat-hf", LLAMA),
        ("WizardLM/WizardCoder-Python-7B-V1.0", WIZARDLM),
        ("WizardLM/WizardCoder-Python-13B-V1.0", WIZARDLM),
        ("WizardLM/WizardCoder-Python-34B-V1.0", WIZARDLM),
    ]
    .into_iter()
    .collect()
});

/// A compiled prompt template with `system` and `instruction` slots.
#[derive(Debug, Clone)]
pub struct PromptTemplate {
    tera: Tera,
}

impl PromptTemplate {
    /// Compiles a template written in Tera syntax.
    ///
    /// # Errors
    ///
    /// Returns a template error if the source does not parse.
    pub fn new(source: &str) -> Result<Self> {
        let mut tera = Tera::default();
        tera.add_raw_template(TEMPLATE_NAME, source)
            .map_err(|e| Error::template(TEMPLATE_NAME, &e))?;
        Ok(Self { tera })
    }

    /// Resolves the template for a model: an explicit override wins over the
    /// built-in table.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the model has no known template.
    pub fn for_model(model_id: &str, custom: Option<&str>) -> Result<Self> {
        if let Some(source) = custom {
            return Self::new(source);
        }

        BUILTIN
            .get(model_id)
            .ok_or_else(|| {
                Error::config(format!(
                    "No prompt template known for model '{model_id}'; set `prompt_template` in the settings file"
                ))
            })
            .and_then(|source| Self::new(source))
    }

    /// Renders the full prompt.
    ///
    /// # Errors
    ///
    /// Returns a template error if rendering fails.
    pub fn render(&self, system: &str, instruction: &str) -> Result<String> {
        let mut context = Context::new();
        context.insert("system", system);
        context.insert("instruction", instruction);

        self.tera
            .render(TEMPLATE_NAME, &context)
            .map_err(|e| Error::template(TEMPLATE_NAME, &e))
    }
}

/// Lists the model ids that have a built-in template.
#[must_use]
pub fn builtin_models() -> Vec<&'static str> {
    let mut ids: Vec<_> = BUILTIN.keys().copied().collect();
    ids.sort_unstable();
    ids
}
