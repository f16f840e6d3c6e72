use crate::core::domain::connection::{Connection, Station};
use crate::utils::error::BusError;
use actix_web::dev::Payload;
use actix_web::{FromRequest, HttpRequest};
use futures_util::future::{ready, Ready};

pub const USER_HEADER: &str = "X-User-Id";
pub const TENANT_HEADER: &str = "X-Tenant-Id";
pub const STATION_HEADER: &str = "X-Station";

/// The caller's identity, validated upstream and forwarded as headers.
///
/// The bus trusts these values; it only checks that they are present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StationIdentity {
    pub user_id: String,
    pub tenant_id: String,
    pub station: Station,
}

impl StationIdentity {
    /// A connection record for a push stream opened by this identity.
    pub fn into_connection(self) -> Connection {
        Connection::new(self.user_id, self.tenant_id, self.station)
    }

    fn from_headers(req: &HttpRequest) -> Result<Self, BusError> {
        let header = |name: &str| {
            req.headers()
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
                .ok_or_else(|| BusError::ApiError(format!("missing {name} header")))
        };
        Ok(Self {
            user_id: header(USER_HEADER)?,
            tenant_id: header(TENANT_HEADER)?,
            station: Station::new(header(STATION_HEADER)?),
        })
    }
}

impl FromRequest for StationIdentity {
    type Error = BusError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        ready(Self::from_headers(req))
    }
}
