//! Property coverage for URL classification.

use arkiv::ArchiveType;
use arkiv::archive_types_for;
use proptest::prelude::*;

proptest! {
    /// Every URL — even garbage — classifies to a list starting with
    /// mhtml and screenshot.
    #[test]
    fn always_includes_web_and_screenshot(input in ".{0,200}") {
        let types = archive_types_for(&input);
        prop_assert!(types.len() >= 2);
        prop_assert_eq!(types[0], ArchiveType::Mhtml);
        prop_assert_eq!(types[1], ArchiveType::Screenshot);
    }

    /// Classification is a pure function of the URL.
    #[test]
    fn deterministic(input in ".{0,200}") {
        prop_assert_eq!(archive_types_for(&input), archive_types_for(&input));
    }

    /// Case never changes the outcome.
    #[test]
    fn case_insensitive(host in "[a-z]{1,10}\\.(com|org)", path in "[a-zA-Z0-9/]{0,30}") {
        let lower = format!("https://{host}/{path}");
        let upper = format!("HTTPS://{}/{}", host.to_uppercase(), path);
        prop_assert_eq!(archive_types_for(&lower), archive_types_for(&upper.to_lowercase()));
    }
}

#[test]
fn end_to_end_expectations() {
    // A plain website.
    assert_eq!(
        archive_types_for("https://example.com/"),
        vec![ArchiveType::Mhtml, ArchiveType::Screenshot]
    );
    // A repository.
    assert_eq!(
        archive_types_for("https://github.com/acme/widget"),
        vec![ArchiveType::Mhtml, ArchiveType::Screenshot, ArchiveType::Git]
    );
    // A user profile is not a repository.
    assert_eq!(
        archive_types_for("https://github.com/acme"),
        vec![ArchiveType::Mhtml, ArchiveType::Screenshot]
    );
    // A video.
    assert_eq!(
        archive_types_for("https://youtu.be/xyz"),
        vec![
            ArchiveType::Mhtml,
            ArchiveType::Screenshot,
            ArchiveType::Youtube
        ]
    );
}
