//! Target construction arguments, as they appear in a table line, and
//! the shape of status reports.
use tracing::instrument;

use crate::exception_store::PersistenceMode;
use crate::fresh_warn;
use crate::result::ErrorKind;
use crate::result::Result;

/// Which status string to report.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StatusType {
    /// Runtime state: validity and usage.
    Info,
    /// The arguments the target was constructed with.
    Table,
}

/// `<origin> <cow> <P|N> <chunk_sectors>`
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SnapshotArgs {
    pub origin: String,
    pub cow: String,
    pub mode: PersistenceMode,
    /// Chunk size in 512-byte sectors.
    pub chunk_sectors: u64,
}

impl SnapshotArgs {
    #[instrument]
    pub fn parse(args: &[&str]) -> Result<SnapshotArgs> {
        if args.len() != 4 {
            return Err(fresh_warn!(
                "snapshot target requires exactly 4 arguments",
                count = args.len()
            )
            .with_kind(ErrorKind::Config));
        }

        let mode = PersistenceMode::parse(args[2])?;
        let chunk_sectors = match args[3].parse::<u64>() {
            Ok(chunk_sectors) if chunk_sectors > 0 => chunk_sectors,
            _ => {
                return Err(fresh_warn!("invalid chunk size", chunk_size=%args[3])
                    .with_kind(ErrorKind::Config))
            }
        };

        Ok(SnapshotArgs {
            origin: args[0].to_string(),
            cow: args[1].to_string(),
            mode,
            chunk_sectors,
        })
    }
}

/// `<device>`
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OriginArgs {
    pub device: String,
}

impl OriginArgs {
    #[instrument]
    pub fn parse(args: &[&str]) -> Result<OriginArgs> {
        match args {
            [device] => Ok(OriginArgs {
                device: device.to_string(),
            }),
            _ => Err(fresh_warn!(
                "origin target requires exactly one argument",
                count = args.len()
            )
            .with_kind(ErrorKind::Config)),
        }
    }
}

#[test]
fn test_parse_snapshot_args() {
    let args = SnapshotArgs::parse(&["/dev/vg/base", "/dev/vg/cow", "p", "16"]).expect("valid");

    assert_eq!(
        args,
        SnapshotArgs {
            origin: "/dev/vg/base".to_string(),
            cow: "/dev/vg/cow".to_string(),
            mode: PersistenceMode::Persistent,
            chunk_sectors: 16,
        }
    );

    let args = SnapshotArgs::parse(&["a", "b", "N", "8"]).expect("valid");
    assert_eq!(args.mode, PersistenceMode::Transient);
}

#[test]
fn test_reject_snapshot_args() {
    let bad: &[&[&str]] = &[
        &["a", "b", "P"],
        &["a", "b", "P", "8", "extra"],
        &["a", "b", "X", "8"],
        &["a", "b", "P", "0"],
        &["a", "b", "P", "-8"],
        &["a", "b", "P", "eight"],
    ];

    for args in bad {
        let err = SnapshotArgs::parse(args).expect_err("must fail");
        assert_eq!(err.kind(), ErrorKind::Config);
    }
}

#[test]
fn test_parse_origin_args() {
    assert_eq!(
        OriginArgs::parse(&["base"]).expect("valid").device,
        "base"
    );
    assert_eq!(
        OriginArgs::parse(&[]).expect_err("missing").kind(),
        ErrorKind::Config
    );
    assert_eq!(
        OriginArgs::parse(&["a", "b"]).expect_err("too many").kind(),
        ErrorKind::Config
    );
}
