pub mod cookies;
pub mod request_factory;
pub mod throttle;

pub use cookies::SharedCookieJar;
pub use request_factory::{HttpTransport, RequestFactory, RequestKind, url_encode};
pub use throttle::ThrottledStream;
