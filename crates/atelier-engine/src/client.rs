use std::env;

use anyhow::{bail, Context, Result};
use atelier_contracts::prompt::{ImageSize, FALLBACK_SIZE};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::blocking::multipart::{Form as MultipartForm, Part as MultipartPart};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Value};

/// Model used first for both generation and edits.
pub const PRIMARY_MODEL: &str = "gpt-image-1";
/// Secondary model tried once when the primary reports a capability error.
/// It only supports square output, so the size is constrained on fallback.
pub const FALLBACK_MODEL: &str = "dall-e-2";

#[derive(Debug, Clone)]
pub struct ImageBytes {
    pub bytes: Vec<u8>,
    pub mime_type: Option<String>,
}

/// The model and size a call actually went out with, reported back so the
/// usage log records what was billed rather than what was asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelChoice {
    pub model: String,
    pub size: ImageSize,
    pub fell_back: bool,
}

impl ModelChoice {
    fn primary(size: ImageSize) -> Self {
        Self {
            model: PRIMARY_MODEL.to_string(),
            size,
            fell_back: false,
        }
    }

    fn fallback() -> Self {
        Self {
            model: FALLBACK_MODEL.to_string(),
            size: FALLBACK_SIZE,
            fell_back: true,
        }
    }
}

/// Blocking client for the remote Images API (`/images/generations` and
/// `/images/edits`).
pub struct ImagesClient {
    api_base: String,
    api_key: String,
    http: HttpClient,
}

impl ImagesClient {
    pub fn new(api_base: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            http: HttpClient::new(),
        }
    }

    pub fn from_env() -> Result<Self> {
        let Some(api_key) = non_empty_env("OPENAI_API_KEY") else {
            bail!("OPENAI_API_KEY not set");
        };
        let api_base = non_empty_env("OPENAI_API_BASE")
            .map(|value| value.trim_end_matches('/').to_string())
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string());
        Ok(Self::new(api_base, api_key))
    }

    /// Text-to-image call. Returns the decoded images plus the model choice
    /// that produced them; a capability error on the primary model triggers
    /// exactly one retry against the fallback configuration.
    pub fn generate(
        &self,
        prompt: &str,
        size: ImageSize,
        n: u64,
    ) -> Result<(Vec<ImageBytes>, ModelChoice)> {
        match self.generate_with(PRIMARY_MODEL, prompt, size, n) {
            Ok(images) => Ok((images, ModelChoice::primary(size))),
            Err(err) if is_capability_error(&err) => {
                let images = self
                    .generate_with(FALLBACK_MODEL, prompt, FALLBACK_SIZE, n)
                    .context("fallback model generation failed")?;
                Ok((images, ModelChoice::fallback()))
            }
            Err(err) => Err(err),
        }
    }

    /// Edit call against the given source PNG, with an optional mask PNG
    /// (transparent = editable). Same single-fallback contract as `generate`.
    pub fn edit(
        &self,
        source_png: &[u8],
        prompt: &str,
        size: ImageSize,
        mask_png: Option<&[u8]>,
    ) -> Result<(ImageBytes, ModelChoice)> {
        match self.edit_with(PRIMARY_MODEL, source_png, prompt, size, mask_png) {
            Ok(image) => Ok((image, ModelChoice::primary(size))),
            Err(err) if is_capability_error(&err) => {
                let image = self
                    .edit_with(FALLBACK_MODEL, source_png, prompt, FALLBACK_SIZE, mask_png)
                    .context("fallback model edit failed")?;
                Ok((image, ModelChoice::fallback()))
            }
            Err(err) => Err(err),
        }
    }

    fn generate_with(
        &self,
        model: &str,
        prompt: &str,
        size: ImageSize,
        n: u64,
    ) -> Result<Vec<ImageBytes>> {
        let endpoint = format!("{}/images/generations", self.api_base);
        let mut payload = json!({
            "model": model,
            "prompt": prompt,
            "n": n.max(1),
        });
        if let Some(size) = size.api_value() {
            payload["size"] = Value::String(size.to_string());
        }

        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .with_context(|| format!("image generation request failed ({endpoint})"))?;
        let response_payload = response_json_or_error("image generation", response)?;

        let mut images = Vec::new();
        for datum in parse_image_data(&response_payload) {
            images.push(self.resolve_datum(datum)?);
        }
        if images.is_empty() {
            bail!("image generation response contained no images");
        }
        Ok(images)
    }

    fn edit_with(
        &self,
        model: &str,
        source_png: &[u8],
        prompt: &str,
        size: ImageSize,
        mask_png: Option<&[u8]>,
    ) -> Result<ImageBytes> {
        let endpoint = format!("{}/images/edits", self.api_base);
        let mut form = MultipartForm::new()
            .text("model", model.to_string())
            .text("prompt", prompt.to_string())
            .text("size", size.as_str().to_string());

        let image_part = MultipartPart::bytes(source_png.to_vec())
            .file_name("image.png")
            .mime_str("image/png")
            .context("invalid mime for source image part")?;
        form = form.part("image", image_part);

        if let Some(mask) = mask_png {
            let mask_part = MultipartPart::bytes(mask.to_vec())
                .file_name("mask.png")
                .mime_str("image/png")
                .context("invalid mime for mask part")?;
            form = form.part("mask", mask_part);
        }

        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .with_context(|| format!("image edit request failed ({endpoint})"))?;
        let response_payload = response_json_or_error("image edit", response)?;

        let datum = parse_image_data(&response_payload)
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("image edit response contained no images"))?;
        self.resolve_datum(datum)
    }

    fn resolve_datum(&self, datum: ImageDatum) -> Result<ImageBytes> {
        match datum {
            ImageDatum::B64(encoded) => {
                let bytes = BASE64
                    .decode(encoded.as_bytes())
                    .context("image base64 decode failed")?;
                Ok(ImageBytes {
                    bytes,
                    mime_type: None,
                })
            }
            ImageDatum::Url(url) => self.download_image(&url),
        }
    }

    fn download_image(&self, url: &str) -> Result<ImageBytes> {
        let response = self
            .http
            .get(url)
            .send()
            .with_context(|| format!("failed downloading image ({url})"))?;
        if !response.status().is_success() {
            let code = response.status().as_u16();
            let body = response.text().unwrap_or_default();
            bail!(
                "image download failed ({code}): {}",
                truncate_text(&body, 512)
            );
        }
        let mime_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let bytes = response
            .bytes()
            .context("failed reading image bytes")?
            .to_vec();
        Ok(ImageBytes { bytes, mime_type })
    }
}

/// One item of a response `data` array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageDatum {
    B64(String),
    Url(String),
}

/// Pulls `b64_json` or `url` entries out of a response payload, preferring
/// inline bytes when both are present.
pub fn parse_image_data(payload: &Value) -> Vec<ImageDatum> {
    let rows = payload
        .get("data")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let mut out = Vec::new();
    for row in rows {
        let Some(obj) = row.as_object() else {
            continue;
        };
        if let Some(b64) = obj
            .get("b64_json")
            .and_then(Value::as_str)
            .filter(|value| !value.is_empty())
        {
            out.push(ImageDatum::B64(b64.to_string()));
            continue;
        }
        if let Some(url) = obj
            .get("url")
            .and_then(Value::as_str)
            .filter(|value| !value.is_empty())
        {
            out.push(ImageDatum::Url(url.to_string()));
        }
    }
    out
}

/// Recognizes the "model requires verification / forbidden" failure that
/// warrants the one-shot fallback. The service reports it in prose, so this
/// stays a substring match on the surfaced error text.
pub fn is_capability_error(err: &anyhow::Error) -> bool {
    let text = format!("{err:#}");
    text.contains("must be verified") || text.contains("403")
}

fn response_json_or_error(label: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let body = response
        .text()
        .with_context(|| format!("{label} response could not be read"))?;
    if !status.is_success() {
        bail!(
            "{label} request failed ({}): {}",
            status.as_u16(),
            truncate_text(&body, 512)
        );
    }
    serde_json::from_str(&body).with_context(|| format!("{label} response was not valid JSON"))
}

fn truncate_text(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let truncated: String = text.chars().take(max_chars).collect();
    format!("{truncated}…")
}

fn non_empty_env(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
