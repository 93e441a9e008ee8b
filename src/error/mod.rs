mod gateway;
mod sse;

pub use gateway::{ErrorBody, ErrorObject, GatewayError};
pub use sse::{error_event_frame, write_stream_error};

pub trait IsRetryable {
    fn is_retryable(&self) -> bool;
}
