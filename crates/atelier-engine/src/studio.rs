use anyhow::{bail, Result};
use atelier_contracts::logs::writer::{
    sha256_short, LogPayload, UsageLogger, INCLUDE_FULL_PROMPT_IN_LOG,
};
use atelier_contracts::prompt::{compose, ImageSize};
use atelier_contracts::session::{ImageArtifact, Session, SessionStore};
use serde_json::json;

use crate::client::{ImagesClient, ModelChoice};
use crate::codec;

/// Loads a session, treating any slot whose bytes no longer decode as
/// absent. A corrupt result degrades to the source-only shape; a corrupt
/// source empties the session.
pub fn load_session(store: &SessionStore) -> Session {
    store.load_validated(|bytes| codec::dimensions(bytes).is_ok())
}

/// One user's generate/edit workflow: composes prompts, talks to the remote
/// service, and commits the outcome to the session in a single step.
///
/// Ordering rule: the session is fully mutated before anything is read back
/// out of it, and it is only mutated once the remote call and the decode have
/// both succeeded. Logging runs last and is best effort; a failed append
/// becomes a warning on the outcome, never an aborted action.
pub struct Studio {
    client: ImagesClient,
    logger: UsageLogger,
    user: String,
}

#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub style: String,
    pub preset: String,
    pub free: String,
    pub size: ImageSize,
    pub n: u64,
}

#[derive(Debug, Clone)]
pub struct GenerateOutcome {
    pub prompt: String,
    pub choice: ModelChoice,
    /// Candidates beyond the first, already canonical PNG. The first image
    /// went into the session's source slot.
    pub extra_images: Vec<Vec<u8>>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct EditOutcome {
    pub choice: ModelChoice,
    pub warnings: Vec<String>,
}

impl Studio {
    pub fn new(client: ImagesClient, logger: UsageLogger, user: impl Into<String>) -> Self {
        Self {
            client,
            logger,
            user: user.into(),
        }
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn generate(
        &self,
        session: &mut Session,
        request: &GenerateRequest,
    ) -> Result<GenerateOutcome> {
        let prompt = compose(&request.style, &request.preset, &request.free);
        if prompt.is_empty() {
            bail!("nothing to send: pick a style, a preset, or type a prompt");
        }

        let (images, choice) = self.client.generate(&prompt, request.size, request.n)?;
        let mut canonical = Vec::new();
        let mut warnings = Vec::new();
        for (idx, image) in images.iter().enumerate() {
            match codec::normalize_png(&image.bytes) {
                Ok(png) => canonical.push(png),
                Err(err) => warnings.push(format!("candidate {} unreadable: {err:#}", idx + 1)),
            }
        }
        let Some(first) = canonical.first().cloned() else {
            bail!("the service returned no readable images");
        };
        let extra_images = canonical.split_off(1);

        session.set_source_from_generation(
            ImageArtifact::png(first),
            &prompt,
            choice.size,
            &choice.model,
        );

        let mut payload = LogPayload::new();
        payload.insert("user".to_string(), json!(self.user));
        payload.insert("model".to_string(), json!(choice.model));
        payload.insert("size".to_string(), json!(choice.size.as_str()));
        payload.insert("n".to_string(), json!(request.n));
        payload.insert("prompt_hash".to_string(), json!(sha256_short(&prompt)));
        if INCLUDE_FULL_PROMPT_IN_LOG {
            payload.insert("prompt".to_string(), json!(prompt));
        }
        self.log_best_effort("generate", payload, &mut warnings);

        Ok(GenerateOutcome {
            prompt,
            choice,
            extra_images,
            warnings,
        })
    }

    pub fn edit(
        &self,
        session: &mut Session,
        prompt: &str,
        size: ImageSize,
        mask: Option<&[u8]>,
    ) -> Result<EditOutcome> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            bail!("the edit prompt is empty");
        }
        if size == ImageSize::Auto {
            bail!("edits need an explicit size");
        }
        if session.can_promote() {
            bail!("an unpromoted result is pending; promote it or reset before editing again");
        }
        let Some(source) = session.source() else {
            bail!("no source image; upload or generate one first");
        };

        let mask_png = mask.map(codec::normalize_png).transpose()?;
        let (image, choice) = self
            .client
            .edit(&source.bytes, prompt, size, mask_png.as_deref())?;
        let png = codec::normalize_png(&image.bytes)?;

        session.accept_edit_result(ImageArtifact::png(png), prompt, choice.size, &choice.model)?;

        let mut warnings = Vec::new();
        let mut payload = LogPayload::new();
        payload.insert("user".to_string(), json!(self.user));
        payload.insert("source".to_string(), json!("inline"));
        payload.insert("model".to_string(), json!(choice.model));
        payload.insert("size".to_string(), json!(choice.size.as_str()));
        payload.insert("mask_used".to_string(), json!(mask.is_some()));
        payload.insert("prompt_hash".to_string(), json!(sha256_short(prompt)));
        if INCLUDE_FULL_PROMPT_IN_LOG {
            payload.insert("prompt".to_string(), json!(prompt));
        }
        self.log_best_effort("edit", payload, &mut warnings);

        Ok(EditOutcome { choice, warnings })
    }

    /// Re-encodes an uploaded file to the canonical form and promotes it to
    /// the source slot.
    pub fn upload(
        &self,
        session: &mut Session,
        file_name: &str,
        bytes: &[u8],
    ) -> Result<Vec<String>> {
        let png = codec::normalize_png(bytes)?;
        let size_bytes = png.len();
        session.set_source_from_upload(ImageArtifact::named(png, file_name));

        let mut warnings = Vec::new();
        let mut payload = LogPayload::new();
        payload.insert("user".to_string(), json!(self.user));
        payload.insert("filename".to_string(), json!(file_name));
        payload.insert("size_bytes".to_string(), json!(size_bytes));
        self.log_best_effort("upload_loaded", payload, &mut warnings);
        Ok(warnings)
    }

    pub fn promote(&self, session: &mut Session) -> Result<()> {
        session.promote_result_to_source()
    }

    pub fn reset(&self, session: &mut Session) -> Vec<String> {
        session.clear();

        let mut warnings = Vec::new();
        let mut payload = LogPayload::new();
        payload.insert("user".to_string(), json!(self.user));
        self.log_best_effort("reset", payload, &mut warnings);
        warnings
    }

    fn log_best_effort(&self, action: &str, payload: LogPayload, warnings: &mut Vec<String>) {
        if let Err(err) = self.logger.append(action, payload) {
            warnings.push(format!("usage log append failed: {err:#}"));
        }
    }
}
