//! CLI parse tests.

use super::{Cli, CliCommand, GetArgs};
use clap::Parser;
use mdm_core::config::FileAllocation;

fn parse(args: &[&str]) -> GetArgs {
    match Cli::try_parse_from(args).unwrap().command {
        CliCommand::Get(a) => a,
    }
}

#[test]
fn cli_parse_get_defaults() {
    let a = parse(&["mdm", "get", "https://example.com/file.iso"]);
    assert_eq!(a.uris, vec!["https://example.com/file.iso"]);
    assert!(!a.force_sequential);
    assert!(a.dir.is_none());
    assert!(a.out.is_none());
    assert!(a.split.is_none());
    assert!(a.checksum.is_none());
    assert!(!a.allow_overwrite);
    assert!(a.file_allocation.is_none());
    assert!(a.max_overall_download_limit.is_none());
}

#[test]
fn cli_parse_get_requires_uri() {
    assert!(Cli::try_parse_from(["mdm", "get"]).is_err());
}

#[test]
fn cli_parse_force_sequential_short() {
    let a = parse(&["mdm", "get", "-Z", "http://a/1", "http://a/2"]);
    assert!(a.force_sequential);
    assert_eq!(a.uris.len(), 2);
}

#[test]
fn cli_parse_checksum() {
    let hex = "AB".repeat(32);
    let a = parse(&["mdm", "get", "--checksum", &format!("sha-256={hex}"), "http://a/f"]);
    assert_eq!(a.checksum, Some("ab".repeat(32)));
}

#[test]
fn cli_parse_checksum_rejects_bad_input() {
    let not_hex = format!("sha-256={}", "zz".repeat(32));
    for bad in ["sha-256=abc", "md5=00", "deadbeef", not_hex.as_str()] {
        assert!(
            Cli::try_parse_from(["mdm", "get", "--checksum", bad, "http://a/f"]).is_err(),
            "{bad} should be rejected"
        );
    }
}

#[test]
fn cli_parse_file_allocation() {
    let a = parse(&["mdm", "get", "--file-allocation", "falloc", "http://a/f"]);
    assert_eq!(a.file_allocation, Some(FileAllocation::Falloc));
    assert!(Cli::try_parse_from(["mdm", "get", "--file-allocation", "sparse", "http://a/f"]).is_err());
}

#[test]
fn cli_parse_split_bounds() {
    let a = parse(&["mdm", "get", "--split", "16", "--out", "x.iso", "http://a/f"]);
    assert_eq!(a.split, Some(16));
    assert_eq!(a.out.as_deref(), Some("x.iso"));
    assert!(Cli::try_parse_from(["mdm", "get", "--split", "0", "http://a/f"]).is_err());
}
