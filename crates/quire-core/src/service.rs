//! Remote reading service contracts and their HTTP implementation.

use crate::chat::{ChatTarget, ChatTurn};
use crate::error::ServiceError;
use crate::model::{Book, CharacterRecord, FeatureFlags, JobKey, JobSnapshot, Paragraph, VoiceParams};
use crate::narration::ClipKey;
use reqwest::Url;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Everything the session engine needs from the server. All calls are
/// cancellable by dropping the returned future.
pub trait ReadingService: Send + Sync + 'static {
    fn fetch_book(&self, book_id: &str) -> impl Future<Output = Result<Book, ServiceError>> + Send;

    fn fetch_features(
        &self,
        book_id: &str,
    ) -> impl Future<Output = Result<FeatureFlags, ServiceError>> + Send;

    fn fetch_chapter(
        &self,
        book_id: &str,
        chapter_id: &str,
    ) -> impl Future<Output = Result<Vec<Paragraph>, ServiceError>> + Send;

    fn fetch_narration(
        &self,
        book_id: &str,
        key: &ClipKey,
        voice: &VoiceParams,
    ) -> impl Future<Output = Result<Vec<u8>, ServiceError>> + Send;

    fn job_status(
        &self,
        book_id: &str,
        key: &JobKey,
    ) -> impl Future<Output = Result<JobSnapshot, ServiceError>> + Send;

    fn request_generation(
        &self,
        book_id: &str,
        key: &JobKey,
    ) -> impl Future<Output = Result<JobSnapshot, ServiceError>> + Send;

    fn regenerate(
        &self,
        book_id: &str,
        key: &JobKey,
        parameter: &str,
    ) -> impl Future<Output = Result<JobSnapshot, ServiceError>> + Send;

    fn characters_up_to(
        &self,
        book_id: &str,
        chapter_index: usize,
        paragraph_index: usize,
    ) -> impl Future<Output = Result<Vec<CharacterRecord>, ServiceError>> + Send;

    fn characters_since(
        &self,
        book_id: &str,
        since_unix_ms: u64,
    ) -> impl Future<Output = Result<Vec<CharacterRecord>, ServiceError>> + Send;

    fn chat(
        &self,
        book_id: &str,
        target: &ChatTarget,
        message: &str,
        history: &[ChatTurn],
    ) -> impl Future<Output = Result<String, ServiceError>> + Send;
}

#[derive(Deserialize)]
struct ChapterBody {
    paragraphs: Vec<Paragraph>,
}

#[derive(Deserialize)]
struct CharactersBody {
    characters: Vec<CharacterRecord>,
}

#[derive(Serialize)]
struct NarrationBody<'a> {
    paragraph_index: usize,
    voice: &'a str,
    speed: f32,
}

#[derive(Serialize)]
struct RegenerateBody<'a> {
    parameter: &'a str,
}

#[derive(Serialize)]
struct ChatBody<'a> {
    target_id: &'a str,
    message: &'a str,
    history: &'a [ChatTurn],
}

#[derive(Deserialize)]
struct ChatReply {
    reply: String,
}

/// JSON-over-HTTP client for the reading service.
#[derive(Clone)]
pub struct HttpService {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpService {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ServiceError> {
        let base_url = Url::parse(base_url)
            .map_err(|err| ServiceError::InvalidUrl(format!("{base_url}: {err}")))?;
        if base_url.cannot_be_a_base() {
            return Err(ServiceError::InvalidUrl(base_url.to_string()));
        }
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base_url })
    }

    /// Base url extended by `segments`, each percent-encoded as one path
    /// segment.
    fn url(&self, segments: &[&str]) -> Result<Url, ServiceError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| ServiceError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, ServiceError> {
        debug!(url = %url, "GET");
        let response = self.client.get(url).send().await?.error_for_status()?;
        Ok(response.json::<T>().await?)
    }

    async fn post_json<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        url: Url,
        body: &B,
    ) -> Result<T, ServiceError> {
        debug!(url = %url, "POST");
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json::<T>().await?)
    }

    fn job_url(&self, book_id: &str, key: &JobKey) -> Result<Url, ServiceError> {
        self.url(&["books", book_id, "chapters", &key.chapter_id, key.kind.as_str()])
    }
}

impl ReadingService for HttpService {
    async fn fetch_book(&self, book_id: &str) -> Result<Book, ServiceError> {
        self.get_json(self.url(&["books", book_id])?).await
    }

    async fn fetch_features(&self, book_id: &str) -> Result<FeatureFlags, ServiceError> {
        self.get_json(self.url(&["books", book_id, "features"])?).await
    }

    async fn fetch_chapter(&self, book_id: &str, chapter_id: &str) -> Result<Vec<Paragraph>, ServiceError> {
        let body: ChapterBody = self
            .get_json(self.url(&["books", book_id, "chapters", chapter_id])?)
            .await?;
        Ok(body.paragraphs)
    }

    async fn fetch_narration(
        &self,
        book_id: &str,
        key: &ClipKey,
        voice: &VoiceParams,
    ) -> Result<Vec<u8>, ServiceError> {
        let url = self.url(&["books", book_id, "chapters", &key.chapter_id, "narration"])?;
        let body = NarrationBody {
            paragraph_index: key.paragraph_index,
            voice: &voice.voice,
            speed: voice.speed,
        };
        let response = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        let bytes = response.bytes().await?;
        debug!(key = %key, bytes = bytes.len(), "Received narration audio");
        Ok(bytes.to_vec())
    }

    async fn job_status(&self, book_id: &str, key: &JobKey) -> Result<JobSnapshot, ServiceError> {
        self.get_json(self.job_url(book_id, key)?).await
    }

    async fn request_generation(&self, book_id: &str, key: &JobKey) -> Result<JobSnapshot, ServiceError> {
        self.post_json(self.job_url(book_id, key)?, &serde_json::json!({})).await
    }

    async fn regenerate(
        &self,
        book_id: &str,
        key: &JobKey,
        parameter: &str,
    ) -> Result<JobSnapshot, ServiceError> {
        let mut url = self.job_url(book_id, key)?;
        url.path_segments_mut()
            .map_err(|()| ServiceError::InvalidUrl(self.base_url.to_string()))?
            .push("regenerate");
        self.post_json(url, &RegenerateBody { parameter }).await
    }

    async fn characters_up_to(
        &self,
        book_id: &str,
        chapter_index: usize,
        paragraph_index: usize,
    ) -> Result<Vec<CharacterRecord>, ServiceError> {
        let mut url = self.url(&["books", book_id, "characters"])?;
        url.query_pairs_mut()
            .append_pair("chapter", &chapter_index.to_string())
            .append_pair("paragraph", &paragraph_index.to_string());
        let body: CharactersBody = self.get_json(url).await?;
        Ok(body.characters)
    }

    async fn characters_since(
        &self,
        book_id: &str,
        since_unix_ms: u64,
    ) -> Result<Vec<CharacterRecord>, ServiceError> {
        let mut url = self.url(&["books", book_id, "characters", "new"])?;
        url.query_pairs_mut()
            .append_pair("since", &since_unix_ms.to_string());
        let body: CharactersBody = self.get_json(url).await?;
        Ok(body.characters)
    }

    async fn chat(
        &self,
        book_id: &str,
        target: &ChatTarget,
        message: &str,
        history: &[ChatTurn],
    ) -> Result<String, ServiceError> {
        let url = self.url(&["books", book_id, "chat", target.kind.as_str()])?;
        let body = ChatBody {
            target_id: &target.target_id,
            message,
            history,
        };
        let reply: ChatReply = self.post_json(url, &body).await?;
        Ok(reply.reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::JobKind;

    fn service(base: &str) -> HttpService {
        HttpService::new(base, Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn job_urls_follow_kind() {
        let key = JobKey::new(JobKind::Illustration, "c7");
        let url = service("http://localhost:8787").job_url("b1", &key).unwrap();
        assert_eq!(url.as_str(), "http://localhost:8787/books/b1/chapters/c7/illustration");
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let url = service("http://localhost:8787/").url(&["books", "x"]).unwrap();
        assert_eq!(url.as_str(), "http://localhost:8787/books/x");
        let url = service("http://localhost:8787/api/").url(&["books", "x"]).unwrap();
        assert_eq!(url.as_str(), "http://localhost:8787/api/books/x");
    }

    #[test]
    fn ids_are_encoded_as_single_segments() {
        let url = service("http://localhost:8787")
            .url(&["books", "a/b?c#d", "chapters", "ch 1"])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://localhost:8787/books/a%2Fb%3Fc%23d/chapters/ch%201"
        );
        assert_eq!(url.query(), None);
        assert_eq!(url.fragment(), None);
    }

    #[test]
    fn unusable_base_url_is_rejected() {
        assert!(matches!(
            HttpService::new("not a url", Duration::from_secs(5)),
            Err(ServiceError::InvalidUrl(_))
        ));
        assert!(matches!(
            HttpService::new("mailto:someone@example.com", Duration::from_secs(5)),
            Err(ServiceError::InvalidUrl(_))
        ));
    }

    #[test]
    fn wire_bodies_decode() {
        let chapter: ChapterBody =
            serde_json::from_str(r#"{"paragraphs":[{"content":"Call me Ishmael."}]}"#).unwrap();
        assert_eq!(chapter.paragraphs[0].content, "Call me Ishmael.");
        let reply: ChatReply = serde_json::from_str(r#"{"reply":"Aye."}"#).unwrap();
        assert_eq!(reply.reply, "Aye.");
    }
}
