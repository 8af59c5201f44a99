use crate::error::ClientError;
use crate::protocol::{ChatRequest, ChatResponse, ChatStats, HistoryPage, Message, SearchResults};
use futures::Stream;
use futures::StreamExt;
use reqwest::{Client as HttpClient, RequestBuilder, Response};
use url::Url;

pub struct ClientConfig {
    pub base_url: String,
    pub token: Option<String>,
}

/// Thin HTTP wrapper over the chat endpoints of the backend.
#[derive(Clone)]
pub struct ChatClient {
    base_url: String,
    token: Option<String>,
    http: HttpClient,
}

type ClientResult<T> = Result<T, ClientError>;

pub type ByteStream = std::pin::Pin<Box<dyn Stream<Item = reqwest::Result<Vec<u8>>> + Send>>;

impl ChatClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            base_url: normalize_base_url(&config.base_url),
            token: config.token,
            http: HttpClient::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Opens `POST /chat/stream` and hands back the raw body once headers arrive.
    pub async fn open_stream(&self, character_id: &str, message: &str) -> ClientResult<ByteStream> {
        let request = ChatRequest {
            character_id: character_id.to_string(),
            message: message.to_string(),
        };
        let response = self
            .authorize(self.http.post(self.url(&["chat", "stream"])?))
            .json(&request)
            .send()
            .await?;
        let response = check_status(response).await?;

        Ok(Box::pin(
            response
                .bytes_stream()
                .map(|chunk| chunk.map(|bytes| bytes.to_vec())),
        ))
    }

    pub async fn send(&self, character_id: &str, message: &str) -> ClientResult<ChatResponse> {
        let request = ChatRequest {
            character_id: character_id.to_string(),
            message: message.to_string(),
        };
        let response = self
            .authorize(self.http.post(self.url(&["chat"])?))
            .json(&request)
            .send()
            .await?;

        Ok(check_status(response).await?.json().await?)
    }

    pub async fn history(
        &self,
        character_id: &str,
        offset: usize,
        limit: usize,
    ) -> ClientResult<HistoryPage> {
        let mut url = self.url(&["chat", "history", character_id])?;
        url.query_pairs_mut()
            .append_pair("offset", &offset.to_string())
            .append_pair("limit", &limit.to_string());

        self.get_json(url).await
    }

    pub async fn search(&self, character_id: &str, query: &str) -> ClientResult<Vec<Message>> {
        let mut url = self.url(&["chat", "history", character_id, "search"])?;
        url.query_pairs_mut().append_pair("q", query);

        let results: SearchResults = self.get_json(url).await?;
        Ok(results.results)
    }

    pub async fn export(&self, character_id: &str) -> ClientResult<serde_json::Value> {
        let url = self.url(&["chat", "history", character_id, "export"])?;
        self.get_json(url).await
    }

    pub async fn clear(&self, character_id: &str) -> ClientResult<()> {
        let url = self.url(&["chat", "history", character_id])?;
        let response = self.authorize(self.http.delete(url)).send().await?;
        check_status(response).await?;
        Ok(())
    }

    pub async fn stats(&self, character_id: &str) -> ClientResult<ChatStats> {
        let url = self.url(&["chat", "history", character_id, "stats"])?;
        self.get_json(url).await
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: Url) -> ClientResult<T> {
        let response = self.authorize(self.http.get(url)).send().await?;
        Ok(check_status(response).await?.json().await?)
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    // Segments are percent-encoded, so character ids cannot escape their path slot.
    fn url(&self, segments: &[&str]) -> ClientResult<Url> {
        let mut url = Url::parse(&self.base_url)?;
        url.path_segments_mut()
            .map_err(|_| url::ParseError::RelativeUrlWithCannotBeABaseBase)?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

async fn check_status(response: Response) -> ClientResult<Response> {
    if response.status().is_success() {
        return Ok(response);
    }

    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    Err(ClientError::Status { status, body })
}

fn normalize_base_url(value: &str) -> String {
    value.trim_end_matches('/').to_string()
}
