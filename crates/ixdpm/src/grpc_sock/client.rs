use std::path::Path;

use tokio::net::UnixStream;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;

/// Returns a channel connected to a unix socket, suitable for the tonic
/// generated clients. Pass it to `SomeClient::new` instead of calling
/// `SomeClient::connect`.
pub async fn socket_channel<P: AsRef<Path>>(path: P) -> Result<Channel, tonic::transport::Error> {
    let path = path.as_ref().to_owned();

    // The endpoint URI is required by the builder but ignored by the
    // connector below.
    Endpoint::from_static("http://[::]:50051")
        .connect_with_connector(service_fn(move |_: Uri| UnixStream::connect(path.clone())))
        .await
}
