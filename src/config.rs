use anyhow::{Context, Result};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    // Discord
    pub discord_token: String,
    pub command_prefix: String,

    // yt-dlp
    pub ytdlp_command: Vec<String>, // p.ej. ["python3", "-m", "yt_dlp"]
    pub ytdlp_format: String,
    pub first_byte_timeout: Duration,

    // Límites
    pub max_queue_size: usize,
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        let config = Self {
            discord_token: std::env::var("DISCORD_TOKEN").context("DISCORD_TOKEN no está definido")?,
            command_prefix: std::env::var("COMMAND_PREFIX").unwrap_or(defaults.command_prefix),

            ytdlp_command: match std::env::var("YTDLP_COMMAND") {
                Ok(val) => split_command(&val),
                Err(_) => defaults.ytdlp_command,
            },
            ytdlp_format: std::env::var("YTDLP_FORMAT").unwrap_or(defaults.ytdlp_format),
            first_byte_timeout: match std::env::var("FIRST_BYTE_TIMEOUT_SECS") {
                Ok(val) => Duration::from_secs(
                    val.trim()
                        .parse()
                        .with_context(|| format!("FIRST_BYTE_TIMEOUT_SECS inválido: {val}"))?,
                ),
                Err(_) => defaults.first_byte_timeout,
            },

            max_queue_size: std::env::var("MAX_QUEUE_SIZE")
                .unwrap_or_else(|_| "1000".to_string())
                .trim()
                .parse()
                .context("MAX_QUEUE_SIZE inválido")?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validates configuration values for correctness.
    ///
    /// # Validation Rules
    ///
    /// - Token, prefix and yt-dlp command must not be empty
    /// - First-byte timeout and queue size must be greater than 0
    pub fn validate(&self) -> Result<()> {
        if self.discord_token.trim().is_empty() {
            anyhow::bail!("Discord token must not be empty");
        }

        if self.command_prefix.is_empty() {
            anyhow::bail!("Command prefix must not be empty");
        }

        if self.ytdlp_command.is_empty() {
            anyhow::bail!("yt-dlp command must not be empty");
        }

        if self.first_byte_timeout.is_zero() {
            anyhow::bail!("First byte timeout must be greater than 0");
        }

        if self.max_queue_size == 0 {
            anyhow::bail!("Max queue size must be greater than 0");
        }

        Ok(())
    }

    /// Returns a summary of the current configuration for logging.
    ///
    /// The Discord token is never included.
    pub fn summary(&self) -> String {
        format!(
            "Config Summary:\n  \
            Prefix: {}\n  \
            yt-dlp: {} (format {})\n  \
            Limits: {} queue, {} first byte timeout",
            self.command_prefix,
            self.ytdlp_command.join(" "),
            self.ytdlp_format,
            self.max_queue_size,
            humantime::format_duration(self.first_byte_timeout),
        )
    }
}

fn split_command(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(str::to_string).collect()
}

/// Default configuration values.
///
/// Used as fallbacks when environment variables are not provided.
impl Default for Config {
    fn default() -> Self {
        Self {
            // Discord (token sin default, debe venir del entorno)
            discord_token: String::new(),
            command_prefix: "!".to_string(),

            ytdlp_command: vec!["yt-dlp".to_string()],
            ytdlp_format: "bestaudio[ext=webm]/bestaudio/best".to_string(),
            first_byte_timeout: Duration::from_secs(20),

            max_queue_size: 1000,
        }
    }
}
