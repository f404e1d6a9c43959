// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-test log capture.

use anyhow::Context as _;
use std::fs::File;
use std::path::Path;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::fmt::TestWriter;
use tracing_subscriber::fmt::writer::EitherWriter;
use tracing_subscriber::fmt::writer::Tee;
use tracing_subscriber::layer::SubscriberExt;

/// Target of guest console and log lines replayed into the test output.
pub const GUEST_LOG_TARGET: &str = "microdroid_guest";

/// Name of the per-test log file in the output directory.
pub const HARNESS_LOG: &str = "harness.log";

/// Installs a subscriber for the current thread that writes to the test
/// output and to `harness.log` in `output_dir`. Logging stops when the
/// returned guard is dropped.
///
/// Filtering follows `MICRODROID_LOG` in `Targets` syntax, defaulting to
/// DEBUG.
pub fn try_init_tracing(output_dir: &Path) -> anyhow::Result<tracing::subscriber::DefaultGuard> {
    let targets = match std::env::var("MICRODROID_LOG") {
        Ok(var) => var
            .parse::<Targets>()
            .with_context(|| format!("invalid MICRODROID_LOG value {var:?}"))?,
        Err(_) => Targets::new().with_default(LevelFilter::DEBUG),
    };
    let log_file = fs_err::File::create(output_dir.join(HARNESS_LOG))?;
    let subscriber = tracing_subscriber::fmt()
        .compact()
        .with_ansi(false) // avoid polluting logs with escape sequences
        .log_internal_errors(true)
        .with_writer(HarnessWriter {
            log_file: log_file.into_parts().0,
        })
        .with_max_level(LevelFilter::TRACE)
        .finish()
        .with(targets);
    Ok(tracing::subscriber::set_default(subscriber))
}

struct HarnessWriter {
    log_file: File,
}

impl<'a> MakeWriter<'a> for HarnessWriter {
    type Writer = EitherWriter<TestWriter, Tee<TestWriter, &'a File>>;

    fn make_writer(&'a self) -> Self::Writer {
        // When unknown err on the side of logging too much.
        EitherWriter::B(Tee::new(TestWriter::new(), &self.log_file))
    }

    fn make_writer_for(&'a self, meta: &tracing::Metadata<'_>) -> Self::Writer {
        // Guest output already lands in its own attached file.
        if meta.target() == GUEST_LOG_TARGET {
            EitherWriter::A(TestWriter::new())
        } else {
            EitherWriter::B(Tee::new(TestWriter::new(), &self.log_file))
        }
    }
}

/// Replays guest output into the test output, one event per line.
pub fn log_guest_output(source: &str, contents: &str) {
    for line in contents.lines() {
        tracing::info!(target: GUEST_LOG_TARGET, source, "{line}");
    }
}

/// Report a file as an attachment to the currently running test. This ensures
/// that the file makes it into the test results.
pub fn trace_attachment(path: impl AsRef<Path>) {
    fn trace(path: &Path) {
        // ATTACHMENT is most reliable when using true canonicalized paths
        match path.canonicalize() {
            Ok(path) => {
                // Use the inline junit syntax to attach the file to the test
                // result.
                println!("[[ATTACHMENT|{}]]", path.display());
            }
            Err(err) => {
                tracing::error!(
                    path = %path.display(),
                    error = &err as &dyn std::error::Error,
                    "failed to canonicalize attachment path"
                );
            }
        }
    }
    trace(path.as_ref());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_reach_log_file_except_guest_lines() {
        let dir = tempfile::tempdir().unwrap();
        {
            let _guard = try_init_tracing(dir.path()).unwrap();
            tracing::info!(vm = "test_vm", "vm started");
            log_guest_output("console", "pvmfw boot\n");
        }
        let log = fs_err::read_to_string(dir.path().join(HARNESS_LOG)).unwrap();
        assert!(log.contains("vm started"), "{log}");
        assert!(!log.contains("pvmfw boot"), "{log}");
    }
}
