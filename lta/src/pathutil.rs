//! Path and URL joining helpers shared by the bundler, replicator, verifier
//! and locator.

use anyhow::{anyhow, Context};
use camino::{Utf8Path, Utf8PathBuf};
use url::Url;

/// Join path segments under a base URL, collapsing duplicate slashes. The
/// base's own path is preserved.
pub fn join_url(base: &Url, items: &[&str]) -> Url {
    let mut url = base.clone();
    {
        let mut path = url.path().trim_end_matches('/').to_string();
        for item in items {
            for segment in item.split('/').filter(|s| !s.is_empty()) {
                path.push('/');
                path.push_str(segment);
            }
        }
        url.set_path(&path);
    }
    url
}

/// Archive entry path for a warehouse file: its logical name relative to the
/// TransferRequest's path prefix.
pub fn relative_entry_path(
    logical_name: &Utf8Path,
    request_path: &Utf8Path,
) -> anyhow::Result<Utf8PathBuf> {
    logical_name
        .strip_prefix(request_path)
        .map(Utf8Path::to_owned)
        .with_context(|| format!("'{logical_name}' is not under request path '{request_path}'"))
}

/// Recover the archive uuid from a File Catalog location path.
///
/// Location paths for archived files look like
/// `/some/path/9a1cab0a395211eab1cbce3a3da73f88.zip:member.tar.gz`; the
/// member suffix is optional.
pub fn archive_uuid_from_location(path: &str) -> anyhow::Result<String> {
    let zip_path = path.split(':').next().unwrap_or(path);
    let basename = Utf8Path::new(zip_path)
        .file_name()
        .ok_or_else(|| anyhow!("location path '{path}' has no file name"))?;
    let uuid = basename.split('.').next().unwrap_or(basename);
    if uuid.is_empty() {
        return Err(anyhow!("location path '{path}' has no archive uuid"));
    }
    Ok(uuid.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_url_collapses_slashes() {
        let base = Url::parse("gsiftp://archive.example.org:2811/pnfs/lta/").unwrap();
        let joined = join_url(&base, &["/data/exp/IceCube/2018", "bundle.zip"]);
        assert_eq!(
            joined.as_str(),
            "gsiftp://archive.example.org:2811/pnfs/lta/data/exp/IceCube/2018/bundle.zip"
        );
    }

    #[test]
    fn join_url_with_empty_items_keeps_the_base() {
        let base = Url::parse("https://example.org/root").unwrap();
        assert_eq!(join_url(&base, &[]).as_str(), "https://example.org/root");
    }

    #[test]
    fn relative_entry_path_strips_the_request_prefix() {
        let rel = relative_entry_path(
            Utf8Path::new("/data/exp/IceCube/2018/unbiased/PFDST/1120/f1.tar.bz2"),
            Utf8Path::new("/data/exp/IceCube/2018/unbiased/PFDST/1120"),
        )
        .unwrap();
        assert_eq!(rel, Utf8PathBuf::from("f1.tar.bz2"));
    }

    #[test]
    fn relative_entry_path_keeps_subdirectories() {
        let rel = relative_entry_path(
            Utf8Path::new("/data/exp/IceCube/2018/unbiased/PFDST/1120/run1/f1.tar.bz2"),
            Utf8Path::new("/data/exp/IceCube/2018"),
        )
        .unwrap();
        assert_eq!(rel, Utf8PathBuf::from("unbiased/PFDST/1120/run1/f1.tar.bz2"));
    }

    #[test]
    fn relative_entry_path_rejects_files_outside_the_request() {
        assert!(relative_entry_path(
            Utf8Path::new("/data/sim/IceCube/2018/f1.tar.bz2"),
            Utf8Path::new("/data/exp/IceCube/2018"),
        )
        .is_err());
    }

    #[test]
    fn archive_uuid_handles_member_suffixes() {
        let uuid = archive_uuid_from_location(
            "/home/projects/icecube/data/exp/0803/9a1cab0a395211eab1cbce3a3da73f88.zip:ukey_5667_SPS-pDAQ.tar.gz",
        )
        .unwrap();
        assert_eq!(uuid, "9a1cab0a395211eab1cbce3a3da73f88");
    }

    #[test]
    fn archive_uuid_handles_plain_zip_paths() {
        let uuid =
            archive_uuid_from_location("/some/path/to/an/archive/8abe369e59a111ea81bb534d1a62b1fe.zip")
                .unwrap();
        assert_eq!(uuid, "8abe369e59a111ea81bb534d1a62b1fe");
    }
}
