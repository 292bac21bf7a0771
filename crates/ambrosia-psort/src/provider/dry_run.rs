use super::{Provider, Request, Response};
use crate::error::ProviderError;

/// Echoes the prompt back as the completion. Never fails, costs nothing.
#[derive(Debug, Default)]
pub struct DryRun {
    echo: bool,
}

impl DryRun {
    /// `echo` prints every prompt to stdout as it is "answered"
    pub fn new(echo: bool) -> Self {
        Self { echo }
    }
}

impl Provider for DryRun {
    fn infer(&self, request: &Request) -> Result<Response, ProviderError> {
        if self.echo {
            println!(
                "--BEGIN\nSystem Prompt: {}\nPrompt: {}\n--END",
                request.system_prompt, request.prompt
            );
        }
        Ok(Response {
            id: request.id,
            completion: request.prompt.clone(),
            tokens: request.prompt.len() as u64 * 2,
        })
    }

    fn ping(&self) -> Result<(), ProviderError> {
        Ok(())
    }

    fn name(&self) -> &str {
        "dry-run"
    }
}
