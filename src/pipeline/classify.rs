//! Deterministic URL → archive-type classification.

use url::Url;

use crate::catalog::ArchiveType;

/// Hosts routed to the video archiver.
const VIDEO_HOSTS: &[&str] = &["youtube.com", "youtu.be", "vimeo.com"];

/// Forges whose `/{owner}/{repo}` paths are clonable.
const FORGE_HOSTS: &[&str] = &["github.com", "gitlab.com", "bitbucket.com", "codeberg.com"];

/// Platform-reserved first path segments that are never repository owners.
const RESERVED_OWNERS: &[&str] = &[
    "settings",
    "notifications",
    "explore",
    "marketplace",
    "pricing",
    "features",
    "security",
    "enterprise",
    "login",
    "join",
    "new",
    "organizations",
    "teams",
    "dashboard",
    "pulls",
    "issues",
    "search",
    "trending",
    "collections",
    "events",
    "sponsors",
    "about",
];

/// Returns the ordered list of archive types for a URL. Every URL gets
/// `mhtml` and `screenshot`; video hosts add `youtube`; clonable URLs add
/// `git`. Decisions are made on the lowercased URL only.
pub fn archive_types_for(url: &str) -> Vec<ArchiveType> {
    let mut types = vec![ArchiveType::Mhtml, ArchiveType::Screenshot];

    let lowered = url.to_ascii_lowercase();
    let Ok(parsed) = Url::parse(&lowered) else {
        return types;
    };
    let Some(host) = parsed.host_str() else {
        return types;
    };
    let host = host.strip_prefix("www.").unwrap_or(host);

    if VIDEO_HOSTS.iter().any(|h| host_matches(host, h)) {
        types.push(ArchiveType::Youtube);
    }

    if looks_like_git_repo(&parsed, host) {
        types.push(ArchiveType::Git);
    }

    types
}

fn host_matches(host: &str, candidate: &str) -> bool {
    host == candidate || host.ends_with(&format!(".{candidate}"))
}

fn looks_like_git_repo(url: &Url, host: &str) -> bool {
    if url.path().trim_end_matches('/').ends_with(".git") {
        return true;
    }
    if host.starts_with("git.") {
        return true;
    }
    if FORGE_HOSTS.iter().any(|h| host_matches(host, h)) {
        let segments: Vec<&str> = url
            .path()
            .split('/')
            .filter(|s| !s.is_empty())
            .collect();
        if segments.len() >= 2 && !RESERVED_OWNERS.contains(&segments[0]) {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_url_gets_mhtml_and_screenshot() {
        let types = archive_types_for("https://example.com/");
        assert_eq!(types, vec![ArchiveType::Mhtml, ArchiveType::Screenshot]);
    }

    #[test]
    fn classification_is_deterministic() {
        let a = archive_types_for("https://github.com/acme/widget");
        let b = archive_types_for("https://github.com/acme/widget");
        assert_eq!(a, b);
    }

    #[test]
    fn video_hosts_add_youtube() {
        assert!(archive_types_for("https://youtu.be/xyz").contains(&ArchiveType::Youtube));
        assert!(
            archive_types_for("https://www.youtube.com/watch?v=xyz")
                .contains(&ArchiveType::Youtube)
        );
        assert!(archive_types_for("https://vimeo.com/12345").contains(&ArchiveType::Youtube));
        assert!(!archive_types_for("https://example.com/youtube").contains(&ArchiveType::Youtube));
    }

    #[test]
    fn forge_owner_repo_adds_git() {
        assert!(archive_types_for("https://github.com/acme/widget").contains(&ArchiveType::Git));
        assert!(archive_types_for("https://codeberg.com/acme/widget").contains(&ArchiveType::Git));
        assert!(
            archive_types_for("https://GitHub.com/Acme/Widget").contains(&ArchiveType::Git),
            "classification lowercases first"
        );
    }

    #[test]
    fn bare_owner_profile_is_not_git() {
        assert!(!archive_types_for("https://github.com/acme").contains(&ArchiveType::Git));
        assert!(!archive_types_for("https://github.com/").contains(&ArchiveType::Git));
    }

    #[test]
    fn reserved_platform_paths_are_not_git() {
        for owner in ["settings", "explore", "pulls", "about", "sponsors"] {
            let url = format!("https://github.com/{owner}/something");
            assert!(
                !archive_types_for(&url).contains(&ArchiveType::Git),
                "{owner} must not classify as a repository owner"
            );
        }
    }

    #[test]
    fn dot_git_suffix_and_git_subdomain_add_git() {
        assert!(
            archive_types_for("https://example.com/repos/thing.git").contains(&ArchiveType::Git)
        );
        assert!(archive_types_for("https://git.example.com/thing").contains(&ArchiveType::Git));
        assert!(!archive_types_for("https://example.com/thing").contains(&ArchiveType::Git));
    }
}
