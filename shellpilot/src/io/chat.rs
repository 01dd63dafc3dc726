//! Minimal client for OpenAI-compatible chat-completions endpoints.
//!
//! OpenAI, DeepSeek, and Gemini's compatibility endpoint all accept the same
//! request shape, so one blocking client covers them.

use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

const ERROR_BODY_PREVIEW: usize = 500;

pub struct ChatClient {
    http: reqwest::blocking::Client,
    url: String,
    api_key: String,
    model: String,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 1],
    temperature: f32,
    response_format: ResponseFormat,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

impl ChatClient {
    pub fn new(api_base: &str, api_key: String, model: String, timeout: Duration) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .context("build http client")?;
        Ok(Self::with_http(http, api_base, api_key, model))
    }

    fn with_http(
        http: reqwest::blocking::Client,
        api_base: &str,
        api_key: String,
        model: String,
    ) -> Self {
        Self {
            http,
            url: format!("{}/chat/completions", api_base.trim_end_matches('/')),
            api_key,
            model,
        }
    }

    /// Send `prompt` as a single user message and return the reply text.
    #[instrument(skip_all, fields(url = %self.url, model = %self.model))]
    pub fn complete(&self, prompt: &str) -> Result<String> {
        let request = ChatRequest {
            model: &self.model,
            messages: [ChatMessage {
                role: "user",
                content: prompt,
            }],
            temperature: 0.0,
            response_format: ResponseFormat {
                kind: "json_object",
            },
        };

        let response = self
            .http
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .with_context(|| format!("POST {}", self.url))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            let preview: String = body.chars().take(ERROR_BODY_PREVIEW).collect();
            bail!("chat completion failed with {status}: {preview}");
        }

        let parsed: ChatResponse = response.json().context("decode chat completion")?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| anyhow!("chat completion has no message content"))?;
        debug!(response_bytes = content.len(), "chat completion received");
        Ok(content)
    }
}

#[cfg(test)]
mod tests {
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;
    use std::thread;

    use super::*;

    /// Answer one HTTP request with `status` and `body`; returns the raw request.
    fn serve_once(
        status: &'static str,
        body: &'static str,
    ) -> (String, thread::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let base = format!("http://{}/v1", listener.local_addr().expect("addr"));
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().expect("accept");
            let mut reader = BufReader::new(stream.try_clone().expect("clone"));
            let mut request = String::new();
            let mut content_length = 0usize;
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).expect("read header");
                if let Some((name, value)) = line.split_once(':')
                    && name.eq_ignore_ascii_case("content-length")
                {
                    content_length = value.trim().parse().expect("content length");
                }
                request.push_str(&line);
                if line == "\r\n" || line.is_empty() {
                    break;
                }
            }
            let mut body_bytes = vec![0u8; content_length];
            reader.read_exact(&mut body_bytes).expect("read body");
            request.push_str(&String::from_utf8_lossy(&body_bytes));

            let mut stream = stream;
            write!(
                stream,
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            )
            .expect("write response");
            request
        });
        (base, handle)
    }

    fn client(base: &str) -> ChatClient {
        let http = reqwest::blocking::Client::builder()
            .no_proxy()
            .timeout(Duration::from_secs(5))
            .build()
            .expect("http client");
        ChatClient::with_http(http, base, "test-key".to_string(), "gpt-test".to_string())
    }

    #[test]
    fn sends_prompt_and_returns_content() {
        let (base, server) = serve_once(
            "200 OK",
            r#"{"choices": [{"message": {"role": "assistant", "content": "{\"approved\": true}"}}]}"#,
        );
        let answer = client(&base).complete("check the disk").expect("complete");
        assert_eq!(answer, r#"{"approved": true}"#);

        let request = server.join().expect("server");
        let lowered = request.to_lowercase();
        assert!(request.starts_with("POST /v1/chat/completions "), "{request}");
        assert!(lowered.contains("authorization: bearer test-key"), "{request}");
        assert!(request.contains(r#""model":"gpt-test""#), "{request}");
        assert!(request.contains("check the disk"), "{request}");
        assert!(request.contains(r#""type":"json_object""#), "{request}");
    }

    #[test]
    fn error_status_includes_body() {
        let (base, server) = serve_once(
            "401 Unauthorized",
            r#"{"error": {"message": "invalid api key"}}"#,
        );
        let err = client(&base).complete("anything").unwrap_err();
        let message = format!("{err:#}");
        assert!(message.contains("401"), "{message}");
        assert!(message.contains("invalid api key"), "{message}");
        server.join().expect("server");
    }

    #[test]
    fn empty_choices_is_an_error() {
        let (base, server) = serve_once("200 OK", r#"{"choices": []}"#);
        let err = client(&base).complete("anything").unwrap_err();
        assert!(err.to_string().contains("no message content"));
        server.join().expect("server");
    }
}
