use std::path::Path;
use std::sync::Arc;

use futures_util::FutureExt;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, BufReader};

use crate::hooks::VerifyHook;
use crate::models::DownloadItem;

#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Compute the SHA-256 digest of a file as a lowercase hex string.
pub async fn sha256_file(path: &Path) -> Result<String, IntegrityError> {
    let file = File::open(path).await?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8 * 1024];
    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Builds a corruption-check hook flagging any downloaded file whose SHA-256
/// digest differs from `expected`. Install it with
/// [`Hooks::verify_with`](crate::hooks::Hooks::verify_with).
pub fn sha256_verifier(expected: impl Into<String>) -> Box<VerifyHook> {
    let expected = expected.into();
    Box::new(move |item: Arc<DownloadItem>| {
        let expected = expected.clone();
        async move {
            let Some(path) = item.file_path() else {
                return true;
            };
            match sha256_file(&path).await {
                Ok(digest) => !digest.eq_ignore_ascii_case(&expected),
                Err(_) => true,
            }
        }
        .boxed()
    })
}
