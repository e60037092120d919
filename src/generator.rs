//! Text generation backends.
//!
//! The pipeline only sees the [`Generator`] trait. [`VllmGenerator`] talks to a
//! vLLM `/generate` endpoint; [`DryRunGenerator`] answers without a model.

use crate::{
    error::Result,
    prompt::PromptTemplate,
    settings::ModelConfig,
    token::TokenEstimator,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

const DRY_RUN_TEXT: &str = "DRY RUN RESULT";
const DRY_RUN_COST: u64 = 10;

/// One generated text and what it cost.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// Generated text, prompt excluded
    pub text: String,
    /// Tokens billed for this candidate
    pub cost: u64,
}

/// Sampling configuration passed through to the generation service.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SamplingParams {
    /// Candidates returned per request
    pub n: u32,
    /// Maximum tokens to generate per candidate
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<usize>,
    /// Number of sequences sampled before returning the best `n`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub best_of: Option<u32>,
    /// Presence penalty
    pub presence_penalty: f32,
    /// Frequency penalty
    pub frequency_penalty: f32,
    /// Temperature
    pub temperature: f32,
    /// Nucleus probability mass
    pub top_p: f32,
    /// Top-k cutoff (-1 disables)
    pub top_k: i32,
    /// Beam search instead of sampling
    pub use_beam_search: bool,
    /// Beam search length penalty
    pub length_penalty: f32,
    /// Beam search early stopping
    pub early_stopping: bool,
    /// Stop sequences
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
    /// Keep generating past end-of-sequence
    pub ignore_eos: bool,
}

/// Capability to turn a system prompt and an instruction into candidates.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Generates candidates, in the order the service returned them.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Generation`] on transport or protocol failures.
    async fn generate(
        &self,
        system: &str,
        instruction: &str,
        params: &SamplingParams,
    ) -> Result<Vec<Candidate>>;
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    prompt: &'a str,
    #[serde(flatten)]
    params: &'a SamplingParams,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    text: Vec<String>,
}

/// Client for a vLLM API server.
///
/// The server echoes the prompt in front of every output; it is stripped from
/// the candidate text but counted in the cost.
pub struct VllmGenerator {
    client: reqwest::Client,
    address: String,
    template: PromptTemplate,
    tokenizer: Arc<dyn TokenEstimator>,
}

impl VllmGenerator {
    /// Creates a client for the configured model.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the model is misconfigured or has no
    /// prompt template.
    pub fn new(model: &ModelConfig, tokenizer: Arc<dyn TokenEstimator>) -> Result<Self> {
        model.validate()?;
        let template = PromptTemplate::for_model(&model.id, model.prompt_template.as_deref())?;

        Ok(Self {
            client: reqwest::Client::new(),
            address: model.address.clone(),
            template,
            tokenizer,
        })
    }
}

#[async_trait]
impl Generator for VllmGenerator {
    #[instrument(skip_all, fields(address = %self.address, n = params.n))]
    async fn generate(
        &self,
        system: &str,
        instruction: &str,
        params: &SamplingParams,
    ) -> Result<Vec<Candidate>> {
        let prompt = self.template.render(system, instruction)?;
        let request = GenerateRequest {
            prompt: &prompt,
            params,
        };

        let response = self
            .client
            .post(&self.address)
            .json(&request)
            .send()
            .await?
            .error_for_status()?;
        let body: GenerateResponse = response.json().await?;

        debug!(outputs = body.text.len(), "Generation response received");

        Ok(body
            .text
            .into_iter()
            .map(|output| {
                let cost = self.tokenizer.estimate(&output) as u64;
                let text = match output.strip_prefix(prompt.as_str()) {
                    Some(generated) => generated.to_string(),
                    None => {
                        warn!("Generation output does not echo the prompt");
                        output
                    }
                };
                Candidate { text, cost }
            })
            .collect())
    }
}

/// Answers every request with placeholder text and never touches a model.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryRunGenerator;

#[async_trait]
impl Generator for DryRunGenerator {
    async fn generate(
        &self,
        _system: &str,
        _instruction: &str,
        params: &SamplingParams,
    ) -> Result<Vec<Candidate>> {
        Ok((0..params.n.max(1))
            .map(|_| Candidate {
                text: DRY_RUN_TEXT.to_string(),
                cost: DRY_RUN_COST,
            })
            .collect())
    }
}

/// Asks the model an easy question and checks the answer looks sane.
///
/// # Errors
///
/// Propagates generation errors.
pub async fn self_test(
    generator: &dyn Generator,
    params: &SamplingParams,
    tokenizer: &dyn TokenEstimator,
) -> Result<bool> {
    let params = SamplingParams {
        n: 1,
        ..params.clone()
    };
    let outputs = generator
        .generate(
            "You are a helpful assistant.",
            "You are a math student. What is the area of a unit square?",
            &params,
        )
        .await?;

    let [output] = outputs.as_slice() else {
        warn!(count = outputs.len(), "Wrong number of outputs");
        return Ok(false);
    };

    if !output.text.contains('1') && !output.text.to_lowercase().contains("one") {
        warn!(text = %output.text, "Unexpected output");
        return Ok(false);
    }

    if output.cost < tokenizer.estimate(&output.text) as u64 {
        warn!(cost = output.cost, "Unexpected cost");
        return Ok(false);
    }

    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::SimpleTokenizer;

    fn model(address: String) -> ModelConfig {
        ModelConfig {
            address,
            prompt_template: Some("{{ system }}|{{ instruction }}|".to_string()),
            ..ModelConfig::new("test/model")
        }
    }

    fn params(n: u32) -> SamplingParams {
        SamplingParams {
            n,
            max_tokens: Some(64),
            ..ModelConfig::new("m").sampling_params()
        }
    }

    #[test]
    fn test_request_flattens_params() {
        let params = params(2);
        let request = GenerateRequest {
            prompt: "p",
            params: &params,
        };
        let value = serde_json::to_value(&request).unwrap();

        assert_eq!(value["prompt"], "p");
        assert_eq!(value["n"], 2);
        assert_eq!(value["max_tokens"], 64);
        assert!(value.get("best_of").is_none());
        assert!(value.get("stop").is_none());
    }

    #[tokio::test]
    async fn test_dry_run_returns_n_candidates() {
        let outputs = DryRunGenerator.generate("s", "i", &params(3)).await.unwrap();

        assert_eq!(outputs.len(), 3);
        assert!(outputs.iter().all(|c| c.text == DRY_RUN_TEXT && c.cost == DRY_RUN_COST));
    }

    #[tokio::test]
    async fn test_vllm_strips_prompt_and_counts_cost() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/generate")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "prompt": "sys|hello|",
                "n": 2
            })))
            .with_header("content-type", "application/json")
            .with_body(r#"{"text": ["sys|hello|first", "sys|hello|second answer"]}"#)
            .create_async()
            .await;

        let generator = VllmGenerator::new(
            &model(format!("{}/generate", server.url())),
            Arc::new(SimpleTokenizer),
        )
        .unwrap();
        let outputs = generator.generate("sys", "hello", &params(2)).await.unwrap();

        mock.assert_async().await;
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[0].text, "first");
        assert_eq!(outputs[1].text, "second answer");
        // "sys|hello|first" is 15 chars = 4 tokens
        assert_eq!(outputs[0].cost, 4);
    }

    #[tokio::test]
    async fn test_vllm_http_error_is_generation_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/generate")
            .with_status(500)
            .create_async()
            .await;

        let generator = VllmGenerator::new(
            &model(format!("{}/generate", server.url())),
            Arc::new(SimpleTokenizer),
        )
        .unwrap();
        let err = generator.generate("s", "i", &params(1)).await.unwrap_err();

        assert!(err.is_generation());
    }

    #[tokio::test]
    async fn test_self_test_accepts_dry_run_shape_only_when_plausible() {
        // The dry-run text does not mention "1", so the check fails.
        let ok = self_test(&DryRunGenerator, &params(1), &SimpleTokenizer)
            .await
            .unwrap();
        assert!(!ok);
    }

    struct Answer(&'static str, u64);

    #[async_trait]
    impl Generator for Answer {
        async fn generate(&self, _: &str, _: &str, _: &SamplingParams) -> Result<Vec<Candidate>> {
            Ok(vec![Candidate {
                text: self.0.to_string(),
                cost: self.1,
            }])
        }
    }

    #[tokio::test]
    async fn test_self_test_checks_answer_and_cost() {
        let p = params(1);
        assert!(self_test(&Answer("The area is 1.", 50), &p, &SimpleTokenizer).await.unwrap());
        assert!(self_test(&Answer("It is ONE", 50), &p, &SimpleTokenizer).await.unwrap());
        assert!(!self_test(&Answer("The area is 1.", 0), &p, &SimpleTokenizer).await.unwrap());
    }
}
