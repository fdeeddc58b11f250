//! Azure Face API client backed by a large face list.

use crate::provider::{FacePage, RemoteDetection, RemoteError, RemoteFace, RemoteMatch, RemoteRecognizer};
use async_trait::async_trait;
use facegate_core::DetectionResult;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const KEY_HEADER: &str = "Ocp-Apim-Subscription-Key";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AzureConfig {
    /// e.g. `https://<resource>.cognitiveservices.azure.com`
    pub endpoint: String,
    pub api_key: String,
    pub face_list_id: String,
    pub detection_model: String,
    pub recognition_model: String,
    /// Faces per listing page (the API maximum is 1000).
    pub page_size: usize,
    pub timeout_ms: u64,
}

impl Default for AzureConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            api_key: String::new(),
            face_list_id: "facegate".into(),
            detection_model: "detection_03".into(),
            recognition_model: "recognition_04".into(),
            page_size: 1000,
            timeout_ms: 5_000,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FaceRectangle {
    left: f32,
    top: f32,
    width: f32,
    height: f32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DetectedFace {
    face_id: Option<String>,
    face_rectangle: FaceRectangle,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedFace {
    persisted_face_id: String,
    user_data: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SimilarFace {
    persisted_face_id: String,
    confidence: f32,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    message: String,
}

pub struct AzureFaceClient {
    client: Client,
    config: AzureConfig,
}

impl AzureFaceClient {
    pub fn new(config: AzureConfig) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| RemoteError::Transport(e.to_string()))?;
        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/face/v1.0/{}", self.config.endpoint.trim_end_matches('/'), path)
    }

    fn list_url(&self, suffix: &str) -> String {
        self.url(&format!("largefacelists/{}{}", self.config.face_list_id, suffix))
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, RemoteError> {
        let response = request
            .header(KEY_HEADER, &self.config.api_key)
            .send()
            .await
            .map_err(|e| RemoteError::Transport(e.to_string()))?;
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&body)
            .map(|b| b.error.message)
            .unwrap_or(body);
        Err(RemoteError::Provider { status, message })
    }

    async fn json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, RemoteError> {
        self.send(request)
            .await?
            .json::<T>()
            .await
            .map_err(|e| RemoteError::Decode(e.to_string()))
    }

    async fn detect_raw(&self, image: &[u8], return_face_id: bool) -> Result<Vec<DetectedFace>, RemoteError> {
        let request = self
            .client
            .post(self.url("detect"))
            .query(&[
                ("detectionModel", self.config.detection_model.as_str()),
                ("recognitionModel", self.config.recognition_model.as_str()),
                ("returnFaceId", if return_face_id { "true" } else { "false" }),
            ])
            .header("Content-Type", "application/octet-stream")
            .body(image.to_vec());
        self.json(request).await
    }

    /// Create the face list; an existing list is fine.
    async fn ensure_list(&self) -> Result<(), RemoteError> {
        let request = self.client.put(self.list_url("")).json(&serde_json::json!({
            "name": self.config.face_list_id,
            "recognitionModel": self.config.recognition_model,
        }));
        match self.send(request).await {
            Ok(_) => Ok(()),
            Err(RemoteError::Provider { status: 409, .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn persisted_face(&self, face_id: &str) -> Result<PersistedFace, RemoteError> {
        self.json(self.client.get(self.list_url(&format!("/persistedfaces/{face_id}"))))
            .await
    }
}

#[async_trait]
impl RemoteRecognizer for AzureFaceClient {
    fn name(&self) -> &str {
        "azure"
    }

    async fn detect(&self, image: &[u8]) -> Result<Vec<RemoteDetection>, RemoteError> {
        let faces = self.detect_raw(image, false).await?;
        Ok(faces
            .into_iter()
            .map(|f| RemoteDetection {
                region: DetectionResult::new(
                    f.face_rectangle.left,
                    f.face_rectangle.top,
                    f.face_rectangle.width,
                    f.face_rectangle.height,
                    1.0,
                ),
                emotion: None,
            })
            .collect())
    }

    async fn index(&self, image: &[u8], correlation_id: &str) -> Result<String, RemoteError> {
        self.ensure_list().await?;
        let request = self
            .client
            .post(self.list_url("/persistedfaces"))
            .query(&[
                ("userData", correlation_id),
                ("detectionModel", self.config.detection_model.as_str()),
            ])
            .header("Content-Type", "application/octet-stream")
            .body(image.to_vec());
        let added: PersistedFace = self.json(request).await?;

        if let Err(e) = self.send(self.client.post(self.list_url("/train"))).await {
            tracing::warn!(error = %e, "face list training request failed");
        }
        tracing::info!(face_id = %added.persisted_face_id, correlation_id, "face indexed remotely");
        Ok(added.persisted_face_id)
    }

    async fn search(&self, image: &[u8]) -> Result<Option<RemoteMatch>, RemoteError> {
        let faces = self.detect_raw(image, true).await?;
        let Some(query_face) = faces
            .into_iter()
            .max_by(|a, b| {
                let area = |f: &DetectedFace| f.face_rectangle.width * f.face_rectangle.height;
                area(a).total_cmp(&area(b))
            })
            .and_then(|f| f.face_id)
        else {
            return Ok(None);
        };

        let request = self.client.post(self.url("findsimilars")).json(&serde_json::json!({
            "faceId": query_face,
            "largeFaceListId": self.config.face_list_id,
            "maxNumOfCandidatesReturned": 1,
            "mode": "matchPerson",
        }));
        let similar: Vec<SimilarFace> = match self.json(request).await {
            Ok(s) => s,
            // An empty or untrained list has nothing to match.
            Err(RemoteError::Provider { status: 404, .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        let Some(best) = similar.into_iter().next() else {
            return Ok(None);
        };

        let face = self.persisted_face(&best.persisted_face_id).await?;
        Ok(Some(RemoteMatch {
            face: RemoteFace {
                face_id: face.persisted_face_id,
                correlation_id: face.user_data,
            },
            similarity: best.confidence.clamp(0.0, 1.0),
        }))
    }

    async fn list_faces(&self, cursor: Option<&str>) -> Result<FacePage, RemoteError> {
        let top = self.config.page_size.clamp(1, 1000);
        let mut request = self
            .client
            .get(self.list_url("/persistedfaces"))
            .query(&[("top", top.to_string())]);
        if let Some(start) = cursor {
            request = request.query(&[("start", start)]);
        }
        let faces: Vec<PersistedFace> = match self.json(request).await {
            Ok(f) => f,
            Err(RemoteError::Provider { status: 404, .. }) => Vec::new(),
            Err(e) => return Err(e),
        };

        let next_cursor = if faces.len() == top {
            faces.last().map(|f| f.persisted_face_id.clone())
        } else {
            None
        };
        Ok(FacePage {
            faces: faces
                .into_iter()
                .map(|f| RemoteFace {
                    face_id: f.persisted_face_id,
                    correlation_id: f.user_data,
                })
                .collect(),
            next_cursor,
        })
    }

    async fn delete_faces(&self, face_ids: &[String]) -> Result<Vec<String>, RemoteError> {
        let mut deleted = Vec::with_capacity(face_ids.len());
        for id in face_ids {
            let request = self.client.delete(self.list_url(&format!("/persistedfaces/{id}")));
            match self.send(request).await {
                Ok(_) => deleted.push(id.clone()),
                Err(RemoteError::Provider { status, .. }) if status == StatusCode::NOT_FOUND.as_u16() => {}
                Err(e) => {
                    return Err(RemoteError::PartialDelete {
                        deleted,
                        source: Box::new(e),
                    })
                }
            }
        }
        Ok(deleted)
    }
}
