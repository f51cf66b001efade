//! Downloading a package archive and extracting it in one go.

use std::path::Path;

use futures::StreamExt;
use krait_digest::{Digest, Md5, Md5Hash, Sha256, Sha256Hash};
use reqwest_middleware::ClientWithMiddleware;
use tokio::io::AsyncWriteExt;
use url::Url;

use crate::{fs::extract_staged, ArchiveDigests, ExtractError};

/// Downloads the archive at `url`, verifies its checksums, and extracts it
/// into `destination` (via a staging directory, see
/// [`crate::fs::extract_staged`]).
///
/// The archive bytes are hashed while they stream to disk; a mismatch with
/// `expected_sha256`/`expected_md5` aborts before anything is extracted and
/// deletes the partial download. `file://` urls skip the network entirely.
pub async fn download_and_extract(
    client: ClientWithMiddleware,
    url: Url,
    destination: &Path,
    expected_sha256: Option<Sha256Hash>,
    expected_md5: Option<Md5Hash>,
) -> Result<ArchiveDigests, ExtractError> {
    if url.scheme() == "file" {
        let path = url
            .to_file_path()
            .map_err(|()| ExtractError::UnsupportedArchiveType(url.to_string()))?;
        let destination = destination.to_path_buf();
        return tokio::task::spawn_blocking(move || {
            let digests = ArchiveDigests {
                md5: krait_digest::compute_file_digest::<Md5>(&path)?,
                sha256: krait_digest::compute_file_digest::<Sha256>(&path)?,
            };
            verify_digests(&digests, expected_sha256, expected_md5)?;
            extract_staged(&path, &destination)
        })
        .await
        .map_err(|e| ExtractError::IoError(std::io::Error::other(e)))?;
    }

    let parent = destination
        .parent()
        .ok_or_else(|| ExtractError::UnsupportedArchiveType(destination.display().to_string()))?;
    fs_err::create_dir_all(parent).map_err(ExtractError::CouldNotCreateDestination)?;

    // The archive is kept next to the extracted directory, under its
    // original name so that extraction (and later cache cleaning) can
    // dispatch on the extension.
    let file_name = url
        .path_segments()
        .and_then(|mut s| s.next_back())
        .unwrap_or("package.conda")
        .to_owned();
    let archive_path = parent.join(&file_name);

    match download_archive(&client, url, &archive_path, expected_sha256, expected_md5).await {
        Ok(digests) => {
            let destination = destination.to_path_buf();
            let archive = archive_path.clone();
            tokio::task::spawn_blocking(move || extract_staged(&archive, &destination))
                .await
                .map_err(|e| ExtractError::IoError(std::io::Error::other(e)))??;
            Ok(digests)
        }
        Err(error) => {
            // Partial or corrupt downloads never stay in the cache.
            let _ = fs_err::remove_file(&archive_path);
            Err(error)
        }
    }
}

/// Streams the archive to disk while hashing it, then verifies the digests.
async fn download_archive(
    client: &ClientWithMiddleware,
    url: Url,
    archive_path: &Path,
    expected_sha256: Option<Sha256Hash>,
    expected_md5: Option<Md5Hash>,
) -> Result<ArchiveDigests, ExtractError> {
    let response = client.get(url.clone()).send().await?;
    let status = response.status();
    if !status.is_success() {
        // `Retry-After` (in its seconds form) is passed along so the retry
        // loop can honor the server's wish, within reason.
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok())
            .map(|seconds| std::time::Duration::from_secs(seconds.min(300)));
        return Err(ExtractError::HttpStatus {
            status,
            url,
            retry_after,
        });
    }

    let mut sha256 = Sha256::new();
    let mut md5 = Md5::new();
    {
        let mut file = tokio::fs::File::create(archive_path).await?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| {
                ExtractError::Transport(reqwest_middleware::Error::Reqwest(e))
            })?;
            sha256.update(&chunk);
            md5.update(&chunk);
            file.write_all(&chunk).await?;
        }
        file.sync_all().await?;
    }

    let digests = ArchiveDigests {
        md5: md5.finalize(),
        sha256: sha256.finalize(),
    };
    verify_digests(&digests, expected_sha256, expected_md5)?;
    Ok(digests)
}

fn verify_digests(
    digests: &ArchiveDigests,
    expected_sha256: Option<Sha256Hash>,
    expected_md5: Option<Md5Hash>,
) -> Result<(), ExtractError> {
    if let Some(expected) = expected_sha256 {
        if digests.sha256 != expected {
            return Err(ExtractError::ChecksumMismatch {
                expected: format!("{expected:x}"),
                actual: format!("{:x}", digests.sha256),
            });
        }
    }
    if let Some(expected) = expected_md5 {
        if digests.md5 != expected {
            return Err(ExtractError::ChecksumMismatch {
                expected: format!("{expected:x}"),
                actual: format!("{:x}", digests.md5),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use assert_matches::assert_matches;
    use krait_digest::compute_file_digest;

    use super::*;

    fn write_tar_bz2(path: &Path) {
        let file = fs_err::File::create(path).unwrap();
        let mut encoder = bzip2::write::BzEncoder::new(file, bzip2::Compression::default());
        {
            let mut builder = tar::Builder::new(&mut encoder);
            let content = b"content";
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, "info/index.json", &content[..])
                .unwrap();
            builder.finish().unwrap();
        }
        encoder.finish().unwrap().flush().unwrap();
    }

    #[tokio::test]
    async fn test_extract_from_file_url() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("foo-1.0-0.tar.bz2");
        write_tar_bz2(&archive);
        let expected = compute_file_digest::<Sha256>(&archive).unwrap();

        let url = Url::from_file_path(&archive).unwrap();
        let client = ClientWithMiddleware::from(reqwest::Client::new());
        let destination = dir.path().join("foo-1.0-0");
        let digests =
            download_and_extract(client, url, &destination, Some(expected), None)
                .await
                .unwrap();

        assert_eq!(digests.sha256, expected);
        assert!(destination.join("info/index.json").is_file());
    }

    #[tokio::test]
    async fn test_checksum_mismatch_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("foo-1.0-0.tar.bz2");
        write_tar_bz2(&archive);

        let wrong = krait_digest::compute_bytes_digest::<Sha256>("something else");
        let url = Url::from_file_path(&archive).unwrap();
        let client = ClientWithMiddleware::from(reqwest::Client::new());
        let destination = dir.path().join("foo-1.0-0");
        let result =
            download_and_extract(client, url, &destination, Some(wrong), None).await;

        assert_matches!(result, Err(ExtractError::ChecksumMismatch { .. }));
    }
}
