use serde::Serialize;

/// Envelope for every successful JSON body served by the API.
///
/// Errors use the same `status` field with the value `"error"`, see the
/// `ResponseError` implementation of `BusError`.
///
/// # Type Parameters
///
/// * `T`: The type of the data payload, which must implement `Serialize`.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    /// Always `"success"` for this type.
    pub status: String,
    pub data: T,
}

impl<T> ApiResponse<T> {
    /// Wraps `data` in a success envelope.
    ///
    /// # Examples
    ///
    /// ```
    /// use station_bus::adapters::api::models::api_response::ApiResponse;
    /// use station_bus::core::domain::delivery::DeliveryReceipt;
    ///
    /// let response = ApiResponse::new(DeliveryReceipt::default());
    /// assert_eq!(response.status, "success");
    /// assert_eq!(response.data.delivered, 0);
    /// ```
    pub fn new(data: T) -> Self {
        Self {
            status: "success".into(),
            data,
        }
    }
}
