//! Integration tests for option handling and mount path rules

use mountbox::mount::manager::{extract_mount_label_from_options, is_valid_mount_path};
use mountbox::mount::options::{get_param_value, is_read_only_mount, MountOptions};
use std::path::Path;

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[test]
fn test_read_only_last_occurrence_wins() {
    assert!(!is_read_only_mount(&[]));
    assert!(is_read_only_mount(&strings(&["rw", "ro"])));
    assert!(!is_read_only_mount(&strings(&["ro", "nodev", "rw"])));
}

#[test]
fn test_param_value_last_match() {
    let params = strings(&["password=a", "ro", "password=b"]);
    assert_eq!(get_param_value(&params, "password"), Some("b".to_string()));
    assert_eq!(get_param_value(&params, "pass"), None);
}

#[test]
fn test_mount_options_rendering() {
    assert_eq!(MountOptions::new().to_string(), "ro");

    let mut options = MountOptions::new();
    options.initialize(&strings(&["nodev", "rw"]), false, "", "");
    assert_eq!(options.to_string(), "rw,nodev,noexec,nosuid");
}

#[test]
fn test_mount_path_validity() {
    let root = Path::new("/media/removable");
    let cases = [
        ("/media/removable/disk", true),
        ("/media/removable/disk/", true),
        ("/media/removable/My Disk (2)", true),
        ("/media/removable", false),
        ("/media/removable/", false),
        ("/media/removable/.", false),
        ("/media/removable/..", false),
        ("/media/removable/a/b", false),
        ("/media/archive/disk", false),
        ("disk", false),
    ];
    for (path, expected) in cases {
        assert_eq!(is_valid_mount_path(Path::new(path), root), expected, "{}", path);
    }
}

#[test]
fn test_mount_label_extraction() {
    let mut options = strings(&["mountlabel=A", "rw", "mountlabel=B"]);
    assert_eq!(extract_mount_label_from_options(&mut options).as_deref(), Some("B"));
    assert_eq!(options, strings(&["rw"]));
}
