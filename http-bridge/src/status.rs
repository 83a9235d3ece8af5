//! Classifies a raw HTTP status code from the app's response into the
//! `WebSessionResponse` shape the bridge returns over RPC (spec.md §4.4,
//! "HTTP status → WebSession.Response is driven by a fixed table").

use shared_types::http_table::{ClientErrorCode, SuccessCode};

#[derive(Debug, Clone, Copy)]
pub enum StatusClass {
    Success(SuccessCode),
    NoContent { should_reset_form: bool },
    Redirect { is_permanent: bool, switch_to_get: bool },
    ClientError(ClientErrorCode),
    ServerError,
    /// Statuses the table doesn't name explicitly; treated as a generic
    /// client or server error by range.
    Unmapped,
}

pub fn classify(status: u16) -> StatusClass {
    match status {
        200 => StatusClass::Success(SuccessCode::Ok),
        201 => StatusClass::Success(SuccessCode::Created),
        202 => StatusClass::Success(SuccessCode::Accepted),
        203 => StatusClass::Success(SuccessCode::NonAuthoritative),
        206 => StatusClass::Success(SuccessCode::PartialContent),
        300 => StatusClass::Success(SuccessCode::MultipleChoices),
        204 => StatusClass::NoContent { should_reset_form: false },
        205 => StatusClass::NoContent { should_reset_form: true },
        301 => StatusClass::Redirect { is_permanent: true, switch_to_get: true },
        308 => StatusClass::Redirect { is_permanent: true, switch_to_get: false },
        303 => StatusClass::Redirect { is_permanent: false, switch_to_get: true },
        302 | 307 => StatusClass::Redirect { is_permanent: false, switch_to_get: false },
        400 => StatusClass::ClientError(ClientErrorCode::BadRequest),
        401 => StatusClass::ClientError(ClientErrorCode::Unauthorized),
        403 => StatusClass::ClientError(ClientErrorCode::Forbidden),
        404 => StatusClass::ClientError(ClientErrorCode::NotFound),
        405 => StatusClass::ClientError(ClientErrorCode::MethodNotAllowed),
        406 => StatusClass::ClientError(ClientErrorCode::NotAcceptable),
        409 => StatusClass::ClientError(ClientErrorCode::Conflict),
        410 => StatusClass::ClientError(ClientErrorCode::Gone),
        413 => StatusClass::ClientError(ClientErrorCode::RequestEntityTooLarge),
        414 => StatusClass::ClientError(ClientErrorCode::RequestUriTooLong),
        415 => StatusClass::ClientError(ClientErrorCode::UnsupportedMediaType),
        416 => StatusClass::ClientError(ClientErrorCode::RequestRangeNotSatisfiable),
        418 => StatusClass::ClientError(ClientErrorCode::ImATeapot),
        s if (400..500).contains(&s) => StatusClass::Unmapped,
        s if (500..600).contains(&s) => StatusClass::ServerError,
        _ => StatusClass::Unmapped,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_known_success_codes() {
        assert!(matches!(classify(200), StatusClass::Success(SuccessCode::Ok)));
        assert!(matches!(classify(201), StatusClass::Success(SuccessCode::Created)));
    }

    #[test]
    fn maps_no_content_variants() {
        assert!(matches!(
            classify(204),
            StatusClass::NoContent { should_reset_form: false }
        ));
        assert!(matches!(
            classify(205),
            StatusClass::NoContent { should_reset_form: true }
        ));
    }

    #[test]
    fn maps_redirect_table() {
        assert!(matches!(
            classify(301),
            StatusClass::Redirect { is_permanent: true, switch_to_get: true }
        ));
        assert!(matches!(
            classify(307),
            StatusClass::Redirect { is_permanent: false, switch_to_get: false }
        ));
    }

    #[test]
    fn unmapped_4xx_falls_back() {
        assert!(matches!(classify(422), StatusClass::Unmapped));
    }

    #[test]
    fn server_errors_catch_all_5xx() {
        assert!(matches!(classify(503), StatusClass::ServerError));
    }
}
