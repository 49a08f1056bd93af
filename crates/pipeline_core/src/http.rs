use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, Response};
use serde::{de::DeserializeOwned, Serialize};
use shared::{
    domain::{ActivityEntry, ChecklistItem, ChecklistItemId, Deal, DealId, Stage},
    error::{ApiError, PipelineError, PipelineResult},
    protocol::{
        ChangeNotification, ChecklistPatch, CollectionScope, DealPatch, NewActivity,
        NewChecklistItem, NewDeal,
    },
};
use tokio::sync::broadcast;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};
use url::Url;

use crate::gateway::{DataGateway, Subscription};

const NOTIFICATION_BUFFER: usize = 128;

/// Gateway talking to the pipeline server over HTTP, with change
/// notifications streamed over its websocket.
#[derive(Clone)]
pub struct HttpGateway {
    http: Client,
    base: Url,
}

impl HttpGateway {
    pub fn new(server_url: &str) -> PipelineResult<Self> {
        let mut base = Url::parse(server_url)
            .map_err(|err| PipelineError::validation(format!("invalid server url: {err}")))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(PipelineError::validation(
                "server_url must start with http:// or https://",
            ));
        }
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self {
            http: Client::new(),
            base,
        })
    }

    fn endpoint(&self, path: &str) -> PipelineResult<Url> {
        self.base
            .join(path)
            .map_err(|err| PipelineError::validation(format!("invalid endpoint {path}: {err}")))
    }

    pub fn ws_url(&self) -> PipelineResult<Url> {
        let mut url = self.endpoint("ws")?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| PipelineError::validation("cannot derive websocket url"))?;
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> PipelineResult<T> {
        let response = self
            .http
            .get(self.endpoint(path)?)
            .send()
            .await
            .map_err(|err| PipelineError::Fetch(err.to_string()))?;
        decode(response, PipelineError::Fetch).await
    }

    async fn post_json<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> PipelineResult<T> {
        let response = self
            .http
            .post(self.endpoint(path)?)
            .json(body)
            .send()
            .await
            .map_err(|err| PipelineError::Write(err.to_string()))?;
        decode(response, PipelineError::Write).await
    }

    async fn patch(&self, path: &str, body: &(impl Serialize + Sync)) -> PipelineResult<()> {
        let response = self
            .http
            .patch(self.endpoint(path)?)
            .json(body)
            .send()
            .await
            .map_err(|err| PipelineError::Write(err.to_string()))?;
        check_status(response, PipelineError::Write).await
    }
}

async fn decode<T: DeserializeOwned>(
    response: Response,
    internal: fn(String) -> PipelineError,
) -> PipelineResult<T> {
    if response.status().is_success() {
        return response
            .json::<T>()
            .await
            .map_err(|err| internal(format!("unexpected response body: {err}")));
    }
    Err(error_from(response, internal).await)
}

async fn check_status(
    response: Response,
    internal: fn(String) -> PipelineError,
) -> PipelineResult<()> {
    if response.status().is_success() {
        return Ok(());
    }
    Err(error_from(response, internal).await)
}

async fn error_from(response: Response, internal: fn(String) -> PipelineError) -> PipelineError {
    let status = response.status();
    match response.json::<ApiError>().await {
        Ok(api_error) => api_error.into_pipeline_error(internal),
        Err(_) => internal(format!("server returned {status}")),
    }
}

#[async_trait]
impl DataGateway for HttpGateway {
    async fn fetch_stages(&self) -> PipelineResult<Vec<Stage>> {
        self.get_json("stages").await
    }

    async fn fetch_cards(&self) -> PipelineResult<Vec<Deal>> {
        self.get_json("deals").await
    }

    async fn fetch_card(&self, card_id: DealId) -> PipelineResult<Deal> {
        self.get_json(&format!("deals/{card_id}")).await
    }

    async fn update_card(&self, card_id: DealId, patch: DealPatch) -> PipelineResult<()> {
        patch.validate()?;
        self.patch(&format!("deals/{card_id}"), &patch).await
    }

    async fn insert_card(&self, new_deal: NewDeal) -> PipelineResult<Deal> {
        new_deal.validate()?;
        self.post_json("deals", &new_deal).await
    }

    async fn fetch_checklist(&self, deal_id: DealId) -> PipelineResult<Vec<ChecklistItem>> {
        self.get_json(&format!("deals/{deal_id}/checklist")).await
    }

    async fn insert_checklist_item(&self, item: NewChecklistItem) -> PipelineResult<ChecklistItem> {
        item.validate()?;
        self.post_json(&format!("deals/{}/checklist", item.deal_id), &item)
            .await
    }

    async fn update_checklist_item(
        &self,
        item_id: ChecklistItemId,
        patch: ChecklistPatch,
    ) -> PipelineResult<()> {
        patch.validate()?;
        self.patch(&format!("checklist/{item_id}"), &patch).await
    }

    async fn fetch_activity(&self, deal_id: DealId) -> PipelineResult<Vec<ActivityEntry>> {
        self.get_json(&format!("deals/{deal_id}/activity")).await
    }

    async fn insert_activity(&self, activity: NewActivity) -> PipelineResult<ActivityEntry> {
        activity.validate()?;
        self.post_json(&format!("deals/{}/activity", activity.deal_id), &activity)
            .await
    }

    async fn subscribe(&self, scope: CollectionScope) -> PipelineResult<Subscription> {
        let ws_url = self.ws_url()?;
        let (ws_stream, _) = connect_async(ws_url.as_str())
            .await
            .map_err(|err| PipelineError::Fetch(format!("failed to connect websocket {ws_url}: {err}")))?;
        let (_, mut ws_reader) = ws_stream.split();
        let (tx, rx) = broadcast::channel(NOTIFICATION_BUFFER);

        let reader = tokio::spawn(async move {
            while let Some(message) = ws_reader.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        match serde_json::from_str::<ChangeNotification>(&text) {
                            Ok(notification) => {
                                if tx.send(notification).is_err() {
                                    break;
                                }
                            }
                            Err(err) => warn!(error = %err, "ignoring malformed change notification"),
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!(error = %err, "change stream failed");
                        break;
                    }
                }
            }
            debug!(?scope, "change stream closed");
        });

        Ok(Subscription::new(scope, rx).with_reader(reader))
    }
}

#[cfg(test)]
#[path = "tests/http_tests.rs"]
mod tests;
