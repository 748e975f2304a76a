//! HTTP client for the aggregation service API

use super::*;
use crate::error::StorageError;
use futures::TryStreamExt;
use reqwest::{header, Client, Response, StatusCode};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// API root without a trailing slash, e.g. `http://localhost:9090`
    pub base_url: String,
    /// Applied to every JSON call. Retrieval streams are only bounded by
    /// the connect timeout.
    pub timeout: Duration,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:9090".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

pub struct AggregatorClient {
    config: AggregatorConfig,
    client: Client,
}

impl AggregatorClient {
    pub fn new(config: AggregatorConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self { config, client })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api{}", self.config.base_url, path)
    }

    fn dataset_path(dataset: &str) -> String {
        format!("/preparation/{}", urlencoding::encode(dataset))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self
            .client
            .get(self.url(path))
            .timeout(self.config.timeout)
            .send()
            .await?;
        handle_response(response).await
    }

    async fn send_json<B, T>(&self, method: reqwest::Method, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: serde::de::DeserializeOwned,
    {
        let response = self
            .client
            .request(method, self.url(path))
            .timeout(self.config.timeout)
            .header(header::CONTENT_TYPE, "application/json")
            .json(body)
            .send()
            .await?;
        handle_response(response).await
    }

    async fn send_empty(&self, method: reqwest::Method, path: &str) -> Result<Response> {
        let response = self
            .client
            .request(method, self.url(path))
            .timeout(self.config.timeout)
            .send()
            .await?;
        check_status(response).await
    }
}

#[async_trait]
impl Aggregator for AggregatorClient {
    async fn list_datasets(&self) -> Result<Vec<Dataset>> {
        self.get_json("/preparation").await
    }

    async fn create_dataset(&self, request: &CreateDatasetRequest) -> Result<Dataset> {
        self.send_json(reqwest::Method::POST, "/preparation", request).await
    }

    async fn list_sources(&self, dataset: &str) -> Result<Vec<Source>> {
        self.get_json(&format!("{}/source", Self::dataset_path(dataset))).await
    }

    async fn create_source(&self, dataset: &str, request: &CreateSourceRequest) -> Result<Source> {
        let path = format!("{}/source", Self::dataset_path(dataset));
        self.send_json(reqwest::Method::POST, &path, request).await
    }

    async fn list_wallets(&self) -> Result<Vec<Wallet>> {
        self.get_json("/wallet").await
    }

    async fn import_wallet(&self, private_key: &str) -> Result<Wallet> {
        let request = ImportWalletRequest {
            private_key: private_key.to_string(),
        };
        self.send_json(reqwest::Method::POST, "/wallet", &request).await
    }

    async fn list_attached_wallets(&self, dataset: &str) -> Result<Vec<Wallet>> {
        self.get_json(&format!("{}/wallet", Self::dataset_path(dataset))).await
    }

    async fn attach_wallet(&self, dataset: &str, address: &str) -> Result<()> {
        let path = format!(
            "{}/wallet/{}",
            Self::dataset_path(dataset),
            urlencoding::encode(address)
        );
        self.send_empty(reqwest::Method::PUT, &path).await?;
        Ok(())
    }

    async fn list_schedules(&self, dataset: &str) -> Result<Vec<Schedule>> {
        self.get_json(&format!("{}/schedules", Self::dataset_path(dataset))).await
    }

    async fn create_schedule(&self, request: &CreateScheduleRequest) -> Result<Schedule> {
        self.send_json(reqwest::Method::POST, "/schedule", request).await
    }

    async fn update_schedule(&self, id: u64, terms: &ScheduleTerms) -> Result<Schedule> {
        self.send_json(reqwest::Method::PATCH, &format!("/schedule/{id}"), terms).await
    }

    async fn delete_schedule(&self, id: u64) -> Result<()> {
        self.send_empty(reqwest::Method::DELETE, &format!("/schedule/{id}")).await?;
        Ok(())
    }

    async fn push_file(&self, source_id: u64, path: &str) -> Result<FileEntry> {
        let request = PushFileRequest {
            path: path.to_string(),
        };
        self.send_json(reqwest::Method::POST, &format!("/source/{source_id}/file"), &request)
            .await
    }

    async fn prepare_to_pack_file(&self, file_id: u64) -> Result<u64> {
        let response = self
            .send_empty(reqwest::Method::POST, &format!("/file/{file_id}/prepare_to_pack"))
            .await?;
        Ok(response.json().await?)
    }

    async fn pack_source(&self, source_id: u64) -> Result<()> {
        self.send_empty(reqwest::Method::POST, &format!("/source/{source_id}/finalize"))
            .await?;
        Ok(())
    }

    async fn get_file(&self, file_id: u64) -> Result<FileEntry> {
        self.get_json(&format!("/file/{file_id}")).await
    }

    async fn get_file_deals(&self, file_id: u64) -> Result<Vec<DealRecord>> {
        self.get_json(&format!("/file/{file_id}/deals")).await
    }

    async fn retrieve(&self, file_id: u64, range: Option<&str>) -> Result<RetrieveResponse> {
        let mut request = self.client.get(self.url(&format!("/file/{file_id}/retrieve")));
        if let Some(range) = range {
            request = request.header(header::RANGE, range);
        }
        let response = check_status(request.send().await?).await?;

        let content_range = response
            .headers()
            .get(header::CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        Ok(RetrieveResponse {
            status: response.status().as_u16(),
            content_length: response.content_length(),
            content_range,
            body: Box::pin(response.bytes_stream().map_err(StorageError::from)),
        })
    }
}

async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let path = response.url().path().to_string();
    let body = response.text().await.unwrap_or_default();
    match status {
        StatusCode::NOT_FOUND => Err(StorageError::BlobNotFound(path)),
        StatusCode::CONFLICT => Err(StorageError::Conflict(if body.is_empty() { path } else { body })),
        _ => Err(StorageError::Remote {
            status: status.as_u16(),
            message: body,
        }),
    }
}

async fn handle_response<T: serde::de::DeserializeOwned>(response: Response) -> Result<T> {
    let response = check_status(response).await?;
    let body = response.json().await?;
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use wiremock::matchers::{body_json, header as header_eq, method, path};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    fn client(server: &MockServer) -> AggregatorClient {
        AggregatorClient::new(AggregatorConfig {
            base_url: server.uri(),
            timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_list_datasets() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/preparation"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"id": 1, "name": "REPLICA_STAGE", "max_size": "31.5GiB"}
            ])))
            .mount(&server)
            .await;

        let datasets = client(&server).list_datasets().await.unwrap();
        assert_eq!(datasets.len(), 1);
        assert_eq!(datasets[0].name, "REPLICA_STAGE");
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/file/7"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/preparation"))
            .respond_with(ResponseTemplate::new(409).set_body_string("already exists"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/file/8/deals"))
            .respond_with(ResponseTemplate::new(503).set_body_string("busy"))
            .mount(&server)
            .await;

        let client = client(&server);
        assert!(client.get_file(7).await.unwrap_err().is_not_found());

        let err = client
            .create_dataset(&CreateDatasetRequest {
                name: "x".into(),
                max_size: "1GiB".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Conflict(ref m) if m == "already exists"));

        let err = client.get_file_deals(8).await.unwrap_err();
        assert!(matches!(err, StorageError::Remote { status: 503, .. }));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_push_and_prepare() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/source/4/file"))
            .and(body_json(serde_json::json!({"path": "abc.bin"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": 99, "path": "abc.bin", "size": 12
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/file/99/prepare_to_pack"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!(4096)))
            .mount(&server)
            .await;

        let client = client(&server);
        let file = client.push_file(4, "abc.bin").await.unwrap();
        assert_eq!(file.id, 99);
        assert_eq!(file.size, 12);
        assert_eq!(client.prepare_to_pack_file(99).await.unwrap(), 4096);
    }

    #[tokio::test]
    async fn test_retrieve_forwards_range() {
        let server = MockServer::start().await;
        let content: Vec<u8> = (0..100u8).collect();
        let served = content.clone();
        Mock::given(method("GET"))
            .and(path("/api/file/5/retrieve"))
            .and(header_eq("range", "bytes=10-19"))
            .respond_with(move |_req: &Request| {
                ResponseTemplate::new(206)
                    .insert_header("content-range", "bytes 10-19/100")
                    .set_body_bytes(served[10..20].to_vec())
            })
            .mount(&server)
            .await;

        let response = client(&server).retrieve(5, Some("bytes=10-19")).await.unwrap();
        assert_eq!(response.status, 206);
        assert_eq!(response.content_range.as_deref(), Some("bytes 10-19/100"));

        let chunks: Vec<_> = response.body.collect().await;
        let body: Vec<u8> = chunks
            .into_iter()
            .flat_map(|c| c.unwrap().to_vec())
            .collect();
        assert_eq!(body, content[10..20]);
    }

    #[tokio::test]
    async fn test_schedule_update_uses_patch() {
        let server = MockServer::start().await;
        let terms = ScheduleTerms {
            price_per_gib_epoch: 0.0,
            price_per_gib: 0.0,
            price_per_deal: 0.0,
            start_delay: "259200s".into(),
            duration: "31536000s".into(),
            verified: false,
            ipni: true,
            keep_unsealed: true,
            url_template: String::new(),
            schedule_cron: String::new(),
            schedule_cron_perpetual: true,
            schedule_deal_number: 0,
            total_deal_number: 0,
            schedule_deal_size: String::new(),
            total_deal_size: String::new(),
            max_pending_deal_size: String::new(),
            max_pending_deal_number: 0,
        };
        let mut stored = serde_json::to_value(&terms).unwrap();
        stored["id"] = 12.into();
        stored["dataset"] = "ds".into();
        stored["provider"] = "f01000".into();

        Mock::given(method("PATCH"))
            .and(path("/api/schedule/12"))
            .respond_with(ResponseTemplate::new(200).set_body_json(stored))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/api/schedule/12"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let client = client(&server);
        let schedule = client.update_schedule(12, &terms).await.unwrap();
        assert_eq!(schedule.provider, "f01000");
        assert_eq!(schedule.terms, terms);
        client.delete_schedule(12).await.unwrap();
    }
}
