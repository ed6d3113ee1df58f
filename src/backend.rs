//! Inference backends that turn a natural-language request into a
//! suggestion string.

use std::process::Stdio;

use log::{debug, info, warn};

use crate::config::{ModelConfig, ModelKind};

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("failed to launch {binary}: {source}")]
    Launch {
        binary: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{binary} exited with {code:?}: {stderr}")]
    Failed {
        binary: String,
        code: Option<i32>,
        stderr: String,
    },
}

/// Settings for a local llama.cpp invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct LlamaCpp {
    pub family: ModelKind,
    pub binary: String,
    pub model_path: String,
    pub context_size: u32,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// The configured suggestion source.
#[derive(Debug, Clone, PartialEq)]
pub enum Backend {
    /// Canned `echo` suggestion for wiring tests and demos.
    Mock,
    /// The input is already the command.
    Passthrough,
    LlamaCpp(LlamaCpp),
}

impl Backend {
    pub fn from_config(config: &ModelConfig) -> Self {
        match config.kind {
            ModelKind::Mock => Backend::Mock,
            ModelKind::Passthrough => Backend::Passthrough,
            family @ (ModelKind::Deepseek | ModelKind::Llama | ModelKind::Qwen) => {
                match config.path.as_deref().filter(|p| !p.is_empty()) {
                    Some(path) => Backend::LlamaCpp(LlamaCpp {
                        family,
                        binary: config.binary.clone(),
                        model_path: crate::config::expand_path(path)
                            .to_string_lossy()
                            .into_owned(),
                        context_size: config.context_size,
                        temperature: config.temperature,
                        max_tokens: config.max_tokens,
                    }),
                    None => {
                        warn!("model type {family:?} has no path; using mock backend");
                        Backend::Mock
                    }
                }
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Backend::Mock => "mock",
            Backend::Passthrough => "passthrough",
            Backend::LlamaCpp(l) => match l.family {
                ModelKind::Deepseek => "deepseek",
                ModelKind::Llama => "llama",
                ModelKind::Qwen => "qwen",
                ModelKind::Mock | ModelKind::Passthrough => "llama.cpp",
            },
        }
    }

    pub async fn generate_suggestion(&self, input: &str) -> Result<String, BackendError> {
        match self {
            Backend::Mock => {
                debug!("mock suggestion for {input:?}");
                Ok(format!("Command: echo 'Processing: {}'", input.replace('\'', "")))
            }
            Backend::Passthrough => Ok(input.to_string()),
            Backend::LlamaCpp(l) => l.generate(input).await,
        }
    }
}

impl LlamaCpp {
    fn prompt(input: &str) -> String {
        format!("### Instruction: Suggest a Linux command for: {input}\n### Response:")
    }

    async fn generate(&self, input: &str) -> Result<String, BackendError> {
        info!("querying {:?} model at {}", self.family, self.model_path);
        let output = tokio::process::Command::new(&self.binary)
            .arg("-m")
            .arg(&self.model_path)
            .arg("-c")
            .arg(self.context_size.to_string())
            .arg("-n")
            .arg(self.max_tokens.to_string())
            .arg("--temp")
            .arg(self.temperature.to_string())
            .arg("--no-display-prompt")
            .arg("-p")
            .arg(Self::prompt(input))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| BackendError::Launch {
                binary: self.binary.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(BackendError::Failed {
                binary: self.binary.clone(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}
