use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::blocking::Client;
use serde_json::{Value, json};
use tracing::debug;

use crate::error::SynthesisError;
use crate::languages::language_name;

const GOOGLE_TTS_RPC: &str = "jQ1olc";
const GOOGLE_TTS_MAX_CHARS: usize = 100;
const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                          (KHTML, like Gecko) Chrome/120.0 Safari/537.36";

static AUDIO_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"jQ1olc","\[\\"(.*)\\"]"#).expect("valid regex"));

pub trait SpeechSynthesizer {
    fn name(&self) -> &str;

    /// Returns the encoded audio for `text` spoken in `language`.
    fn synthesize(&self, text: &str, language: &str) -> Result<Vec<u8>, SynthesisError>;
}

#[derive(Debug, Clone)]
pub struct GoogleTtsOptions {
    pub tld: String,
    pub slow: bool,
}

impl Default for GoogleTtsOptions {
    fn default() -> Self {
        Self {
            tld: "com".to_string(),
            slow: false,
        }
    }
}

/// Client for the speech endpoint behind Google Translate.
#[derive(Debug)]
pub struct GoogleTranslateTts {
    client: Client,
    endpoint: String,
    slow: bool,
}

impl GoogleTranslateTts {
    pub fn new(options: &GoogleTtsOptions) -> Result<Self, SynthesisError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            client,
            endpoint: format!(
                "https://translate.google.{}/_/TranslateWebserverUi/data/batchexecute",
                options.tld
            ),
            slow: options.slow,
        })
    }

    fn request_part(&self, part: &str, language: &str) -> Result<Vec<u8>, SynthesisError> {
        let response = self
            .client
            .post(&self.endpoint)
            .form(&[("f.req", package_rpc(part, language, self.slow))])
            .send()?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().unwrap_or_default();
            return Err(SynthesisError::Status {
                status: status.as_u16(),
                message: message.chars().take(200).collect(),
            });
        }

        extract_audio(&response.text()?)
    }
}

impl SpeechSynthesizer for GoogleTranslateTts {
    fn name(&self) -> &str {
        "google-translate"
    }

    fn synthesize(&self, text: &str, language: &str) -> Result<Vec<u8>, SynthesisError> {
        if language_name(language).is_none() {
            return Err(SynthesisError::UnsupportedLanguage(language.to_string()));
        }

        let mut audio = Vec::new();
        for part in split_for_request(text, GOOGLE_TTS_MAX_CHARS) {
            debug!("requesting {} chars of speech", part.chars().count());
            audio.extend(self.request_part(&part, language)?);
        }
        if audio.is_empty() {
            return Err(SynthesisError::NoAudio);
        }
        Ok(audio)
    }
}

/// Builds the `f.req` form value for one speech request.
fn package_rpc(text: &str, language: &str, slow: bool) -> String {
    let speed = if slow { Value::Bool(true) } else { Value::Null };
    let parameter = json!([text, language, speed, "null"]).to_string();
    json!([[[GOOGLE_TTS_RPC, parameter, Value::Null, "generic"]]]).to_string()
}

fn extract_audio(body: &str) -> Result<Vec<u8>, SynthesisError> {
    let mut audio = Vec::new();
    for line in body.lines().filter(|line| line.contains(GOOGLE_TTS_RPC)) {
        if let Some(captures) = AUDIO_RE.captures(line) {
            audio.extend(STANDARD.decode(&captures[1])?);
        }
    }
    if audio.is_empty() {
        return Err(SynthesisError::NoAudio);
    }
    Ok(audio)
}

/// Breaks `text` on word boundaries into parts of at most `max_len` chars.
fn split_for_request(text: &str, max_len: usize) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for word in text.split_whitespace() {
        let word_len = word.chars().count();
        if word_len > max_len {
            if !current.is_empty() {
                parts.push(std::mem::take(&mut current));
                current_len = 0;
            }
            let chars: Vec<char> = word.chars().collect();
            parts.extend(chars.chunks(max_len).map(|chunk| chunk.iter().collect::<String>()));
            continue;
        }

        if current.is_empty() {
            current.push_str(word);
            current_len = word_len;
        } else if current_len + 1 + word_len <= max_len {
            current.push(' ');
            current.push_str(word);
            current_len += 1 + word_len;
        } else {
            parts.push(std::mem::replace(&mut current, word.to_string()));
            current_len = word_len;
        }
    }

    if !current.is_empty() {
        parts.push(current);
    }
    parts
}
