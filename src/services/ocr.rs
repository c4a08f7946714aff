use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use crate::models::job::ImageRef;
use crate::models::receipt::ExtractedReceipt;
use crate::services::encryption::EncryptionService;
use crate::services::extraction::{ExtractionContext, ExtractionError, ReceiptExtractor};
use crate::services::normalize::{normalize_receipt, RawReceipt};
use crate::services::storage::R2Client;

const LLAVA_MODEL: &str = "@cf/llava-hf/llava-1.5-7b-hf";

const RECEIPT_PROMPT: &str = concat!(
    "Analyze this receipt image and extract the following fields as JSON: ",
    "merchant (store or vendor name), amount (the final total paid, as a number), ",
    "currency (ISO 4217 code), category (one of groceries, dining, transport, utilities, ",
    "shopping, health, entertainment, travel, other), date (YYYY-MM-DD), ",
    "confidence (your confidence in the extraction from 0 to 1). ",
    "Return ONLY valid JSON with these exact field names."
);

/// Client for Cloudflare Workers AI LLaVA model.
pub struct WorkersAiClient {
    http: Client,
    account_id: String,
    api_token: String,
}

#[derive(Deserialize)]
struct LlavaResponse {
    result: LlavaResult,
}

#[derive(Deserialize)]
struct LlavaResult {
    description: String,
}

impl WorkersAiClient {
    pub fn new(account_id: &str, api_token: &str) -> Result<Self, ExtractionError> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            account_id: account_id.to_string(),
            api_token: api_token.to_string(),
        })
    }

    /// Send a receipt image to Workers AI LLaVA and return its raw answer.
    pub async fn describe_receipt(&self, image_bytes: &[u8]) -> Result<String, ExtractionError> {
        let url = format!(
            "https://api.cloudflare.com/client/v4/accounts/{}/ai/run/{}",
            self.account_id, LLAVA_MODEL
        );

        let request_body = serde_json::json!({
            "image": base64::engine::general_purpose::STANDARD.encode(image_bytes),
            "prompt": RECEIPT_PROMPT,
            "max_tokens": 512
        });

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_token)
            .json(&request_body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ExtractionError::Service {
                status: status.as_u16(),
                message,
            });
        }

        let llava_resp: LlavaResponse = response.json().await?;
        Ok(llava_resp.result.description)
    }
}

/// The model tends to wrap its JSON in prose or code fences; keep the
/// outermost object.
fn json_object(description: &str) -> &str {
    match (description.find('{'), description.rfind('}')) {
        (Some(start), Some(end)) if start < end => &description[start..=end],
        _ => description,
    }
}

/// Parse the model's answer into a validated receipt.
pub fn parse_receipt(description: &str) -> Result<ExtractedReceipt, ExtractionError> {
    let raw: RawReceipt = serde_json::from_str(json_object(description))?;
    normalize_receipt(raw)
}

/// Production extractor: fetch the sealed image from R2, open it, and ask
/// Workers AI to read it.
pub struct WorkersAiExtractor {
    storage: Arc<R2Client>,
    encryption: Arc<EncryptionService>,
    client: Arc<WorkersAiClient>,
}

impl WorkersAiExtractor {
    pub fn new(
        storage: Arc<R2Client>,
        encryption: Arc<EncryptionService>,
        client: Arc<WorkersAiClient>,
    ) -> Self {
        Self {
            storage,
            encryption,
            client,
        }
    }
}

#[async_trait]
impl ReceiptExtractor for WorkersAiExtractor {
    async fn extract(
        &self,
        image: &ImageRef,
        ctx: &ExtractionContext,
    ) -> Result<ExtractedReceipt, ExtractionError> {
        tracing::debug!(job_id = %ctx.job_id, image_key = %image.key, "Downloading image from R2");
        let sealed = self.storage.download(&image.key).await?;
        ctx.progress.report(30).await;

        let image_bytes = self.encryption.open(&image.key, &sealed)?;
        ctx.progress.report(60).await;

        tracing::debug!(job_id = %ctx.job_id, attempt = ctx.attempt, "Calling Workers AI");
        let description = self.client.describe_receipt(&image_bytes).await?;
        ctx.progress.report(100).await;

        parse_receipt(&description)
    }
}
