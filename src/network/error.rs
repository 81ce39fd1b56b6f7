use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("failed to bind multicast socket: {0}")]
    Bind(std::io::Error),

    #[error("failed to join multicast group: {0}")]
    Join(std::io::Error),

    #[error("send failed: {0}")]
    Send(std::io::Error),

    #[error("receive failed: {0}")]
    Recv(std::io::Error),
}
