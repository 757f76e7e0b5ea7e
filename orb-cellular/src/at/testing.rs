use super::{AtChannel, AtResult, Cmd};
use async_trait::async_trait;
use std::collections::VecDeque;

/// Replays canned modem responses in order and records every command sent.
/// Panics on a command it was not scripted for.
#[derive(Debug, Default)]
pub struct ScriptedChannel {
    script: VecDeque<(String, AtResult)>,
    pub sent: Vec<String>,
    pub payloads: Vec<String>,
}

impl ScriptedChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expects a command starting with `prefix` and answers it with `lines`.
    pub fn expect(mut self, prefix: &str, lines: &[&str]) -> Self {
        self.script
            .push_back((prefix.to_string(), AtResult::from_lines(lines)));
        self
    }

    pub fn expect_timeout(mut self, prefix: &str) -> Self {
        self.script
            .push_back((prefix.to_string(), AtResult::timeout(vec![])));
        self
    }

    pub fn is_done(&self) -> bool {
        self.script.is_empty()
    }
}

#[async_trait]
impl AtChannel for ScriptedChannel {
    async fn cmd(&mut self, cmd: &Cmd) -> AtResult {
        self.sent.push(cmd.text().to_string());
        let Some((prefix, result)) = self.script.pop_front() else {
            panic!("unexpected command `{cmd}`");
        };
        assert!(
            cmd.text().starts_with(&prefix),
            "expected `{prefix}`, got `{cmd}`"
        );

        result
    }

    async fn cmd_with_prompt(&mut self, cmd: &Cmd, payload: &str) -> AtResult {
        self.payloads.push(payload.to_string());
        self.cmd(cmd).await
    }
}
