//! HTTP clients for the trip, user and payment services.

use async_trait::async_trait;
use busline_core::collaborators::{PaymentGateway, TripCatalog, TripDetails, UserDirectory, UserProfile};
use busline_core::payment::TransactionSnapshot;
use busline_core::{CoreError, CoreResult};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::retry::RetryPolicy;

/// Shared plumbing: base URL, error classification and retry.
#[derive(Clone)]
struct ServiceClient {
    client: reqwest::Client,
    base_url: String,
    service: &'static str,
    retry: RetryPolicy,
}

impl ServiceClient {
    fn new(client: reqwest::Client, base_url: &str, service: &'static str, retry: RetryPolicy) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            service,
            retry,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> CoreResult<T> {
        let url = self.url(path);
        let url = url.as_str();
        self.retry
            .execute(self.service, move || async move {
                let response = self.client.get(url).send().await.map_err(|e| self.transport_error(e))?;
                self.decode(response).await
            })
            .await
    }

    async fn post_json<B: Serialize + Sync, T: DeserializeOwned>(&self, path: &str, body: &B) -> CoreResult<T> {
        let url = self.url(path);
        let url = url.as_str();
        self.retry
            .execute(self.service, move || async move {
                let response = self
                    .client
                    .post(url)
                    .json(body)
                    .send()
                    .await
                    .map_err(|e| self.transport_error(e))?;
                self.decode(response).await
            })
            .await
    }

    async fn post_unit<B: Serialize + Sync>(&self, path: &str, body: &B) -> CoreResult<()> {
        let url = self.url(path);
        let url = url.as_str();
        self.retry
            .execute(self.service, move || async move {
                let response = self
                    .client
                    .post(url)
                    .json(body)
                    .send()
                    .await
                    .map_err(|e| self.transport_error(e))?;
                let status = response.status();
                if status.is_success() {
                    Ok(())
                } else {
                    Err(classify(self.service, status, response.text().await.unwrap_or_default()))
                }
            })
            .await
    }

    async fn decode<T: DeserializeOwned>(&self, response: reqwest::Response) -> CoreResult<T> {
        let status = response.status();
        if !status.is_success() {
            return Err(classify(self.service, status, response.text().await.unwrap_or_default()));
        }
        response.json::<T>().await.map_err(|e| CoreError::Collaborator {
            service: self.service.to_string(),
            message: format!("invalid response body: {}", e),
            retryable: false,
        })
    }

    fn transport_error(&self, err: reqwest::Error) -> CoreError {
        CoreError::Collaborator {
            service: self.service.to_string(),
            message: err.to_string(),
            retryable: err.is_timeout() || err.is_connect() || err.is_request(),
        }
    }
}

/// 404 is a domain "not found"; other 4xx are permanent; 5xx are retried.
fn classify(service: &str, status: StatusCode, body: String) -> CoreError {
    if status == StatusCode::NOT_FOUND {
        return CoreError::NotFound(format!("{}: {}", service, body));
    }
    CoreError::Collaborator {
        service: service.to_string(),
        message: format!("{} {}", status, body),
        retryable: status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS,
    }
}

#[derive(Serialize)]
struct SeatsRequest<'a> {
    booking_id: Option<Uuid>,
    seat_ids: &'a [String],
}

#[derive(Deserialize)]
struct SeatLabel {
    seat_id: String,
    label: String,
}

#[derive(Clone)]
pub struct HttpTripCatalog {
    inner: ServiceClient,
}

impl HttpTripCatalog {
    pub fn new(client: reqwest::Client, base_url: &str, retry: RetryPolicy) -> Self {
        Self {
            inner: ServiceClient::new(client, base_url, "trip-service", retry),
        }
    }
}

#[async_trait]
impl TripCatalog for HttpTripCatalog {
    async fn trip(&self, trip_id: Uuid) -> CoreResult<TripDetails> {
        self.inner.get_json(&format!("/trips/{}", trip_id)).await
    }

    async fn seat_labels(&self, trip_id: Uuid, seat_ids: &[String]) -> CoreResult<Vec<String>> {
        let found: Vec<SeatLabel> = self
            .inner
            .post_json(
                &format!("/trips/{}/seats/lookup", trip_id),
                &SeatsRequest { booking_id: None, seat_ids },
            )
            .await?;

        seat_ids
            .iter()
            .map(|seat_id| {
                found
                    .iter()
                    .find(|s| &s.seat_id == seat_id)
                    .map(|s| s.label.clone())
                    .ok_or_else(|| CoreError::NotFound(format!("seat {} on trip {}", seat_id, trip_id)))
            })
            .collect()
    }

    async fn mark_seats_booked(&self, trip_id: Uuid, seat_ids: &[String], booking_id: Uuid) -> CoreResult<()> {
        self.inner
            .post_unit(
                &format!("/trips/{}/seats/book", trip_id),
                &SeatsRequest { booking_id: Some(booking_id), seat_ids },
            )
            .await
    }

    async fn release_seats(&self, trip_id: Uuid, seat_ids: &[String], booking_id: Uuid) -> CoreResult<()> {
        self.inner
            .post_unit(
                &format!("/trips/{}/seats/release", trip_id),
                &SeatsRequest { booking_id: Some(booking_id), seat_ids },
            )
            .await
    }
}

#[derive(Clone)]
pub struct HttpUserDirectory {
    inner: ServiceClient,
}

impl HttpUserDirectory {
    pub fn new(client: reqwest::Client, base_url: &str, retry: RetryPolicy) -> Self {
        Self {
            inner: ServiceClient::new(client, base_url, "user-service", retry),
        }
    }
}

#[async_trait]
impl UserDirectory for HttpUserDirectory {
    async fn user(&self, user_id: Uuid) -> CoreResult<UserProfile> {
        self.inner.get_json(&format!("/users/{}", user_id)).await
    }
}

#[derive(Clone)]
pub struct HttpPaymentGateway {
    inner: ServiceClient,
}

impl HttpPaymentGateway {
    pub fn new(client: reqwest::Client, base_url: &str, retry: RetryPolicy) -> Self {
        Self {
            inner: ServiceClient::new(client, base_url, "payment-service", retry),
        }
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    async fn transaction_status(&self, booking_id: Uuid) -> CoreResult<TransactionSnapshot> {
        self.inner
            .get_json(&format!("/transactions/by-booking/{}", booking_id))
            .await
    }
}
