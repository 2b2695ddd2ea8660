//! CLI channel: stdin/stdout REPL for local testing.
//!
//! Lines of the form `group: text` go to that group; anything else goes to
//! the default group.

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::channels::{Channel, IncomingMessage, MessageStream, OutgoingResponse};
use crate::error::ChannelError;

/// A simple CLI channel that reads from stdin and writes to stdout.
pub struct CliChannel {
    default_group: String,
}

impl CliChannel {
    pub fn new(default_group: impl Into<String>) -> Self {
        Self {
            default_group: default_group.into(),
        }
    }

    /// Split `group: text` into its parts. Group names are a single word.
    pub fn parse_line(&self, line: &str) -> Option<(String, String)> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        if let Some((group, text)) = line.split_once(':') {
            let group = group.trim();
            let text = text.trim();
            if !group.is_empty()
                && !text.is_empty()
                && !group.contains(char::is_whitespace)
                && !group.starts_with('@')
            {
                return Some((group.to_string(), text.to_string()));
            }
        }
        Some((self.default_group.clone(), line.to_string()))
    }
}

#[async_trait]
impl Channel for CliChannel {
    fn name(&self) -> &str {
        "cli"
    }

    async fn start(&self) -> Result<MessageStream, ChannelError> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let parser = CliChannel::new(self.default_group.clone());

        tokio::spawn(async move {
            let stdin = tokio::io::stdin();
            let reader = BufReader::new(stdin);
            let mut lines = reader.lines();

            eprint!("> ");

            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let Some((group, text)) = parser.parse_line(&line) else {
                            eprint!("> ");
                            continue;
                        };
                        let msg = IncomingMessage::new("cli", group, "local-user", text);
                        if tx.send(msg).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break, // EOF
                    Err(e) => {
                        tracing::error!("Error reading stdin: {}", e);
                        break;
                    }
                }
            }
        });

        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn send(&self, response: OutgoingResponse) -> Result<(), ChannelError> {
        println!("\n[{}] {}\n", response.group_id, response.content);
        eprint!("> ");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_group_prefix() {
        let cli = CliChannel::new("main");
        assert_eq!(
            cli.parse_line("family: @Andy dinner plans?"),
            Some(("family".to_string(), "@Andy dinner plans?".to_string()))
        );
    }

    #[test]
    fn falls_back_to_default_group() {
        let cli = CliChannel::new("main");
        assert_eq!(
            cli.parse_line("what time is it: now?"),
            Some(("main".to_string(), "what time is it: now?".to_string()))
        );
        assert_eq!(
            cli.parse_line("hello"),
            Some(("main".to_string(), "hello".to_string()))
        );
        assert_eq!(
            cli.parse_line("@Andy: hi"),
            Some(("main".to_string(), "@Andy: hi".to_string()))
        );
    }

    #[test]
    fn blank_lines_ignored() {
        let cli = CliChannel::new("main");
        assert_eq!(cli.parse_line("   "), None);
    }

    #[test]
    fn channel_name() {
        assert_eq!(CliChannel::new("main").name(), "cli");
    }
}
