//! Building kernel programs from source or loading them from binaries.

use tracing::{debug, info, warn};

use crate::backend::{ComputeBackend, ProgramSource, SourceKind};
use crate::config::LineEnding;
use crate::error::{ConfigurationError, DispatchError, Result, Stage};

/// A successfully built program.
///
/// Failed builds never produce an artifact; they surface as
/// [`DispatchError::Build`] or [`DispatchError::BinaryLoad`] with the log.
#[derive(Debug)]
pub struct ProgramArtifact<P> {
    program: P,
    kind: SourceKind,
    build_log: String,
}

impl<P> ProgramArtifact<P> {
    pub fn program(&self) -> &P {
        &self.program
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    /// Normalized build log; may be empty.
    pub fn build_log(&self) -> &str {
        &self.build_log
    }

    pub fn into_program(self) -> P {
        self.program
    }
}

/// Compiles or loads programs for one backend.
pub struct ProgramBuilder<'a, B: ComputeBackend> {
    backend: &'a B,
    options: &'a str,
    line_ending: LineEnding,
}

impl<'a, B: ComputeBackend> ProgramBuilder<'a, B> {
    pub fn new(backend: &'a B) -> Self {
        Self { backend, options: "", line_ending: LineEnding::default() }
    }

    pub fn with_options(mut self, options: &'a str) -> Self {
        self.options = options;
        self
    }

    pub fn with_line_ending(mut self, line_ending: LineEnding) -> Self {
        self.line_ending = line_ending;
        self
    }

    /// Build from whichever source form the caller supplied.
    pub fn build(
        &self,
        session: &B::Session,
        source: ProgramSource<'_>,
    ) -> Result<ProgramArtifact<B::Program>> {
        match source {
            ProgramSource::Text(text) => self.build_from_source(session, text),
            ProgramSource::Binary(bytes) => self.load_from_binary(session, bytes),
        }
    }

    /// Compile source text for the session's device.
    pub fn build_from_source(
        &self,
        session: &B::Session,
        text: &str,
    ) -> Result<ProgramArtifact<B::Program>> {
        let source = ProgramSource::Text(text);
        if source.is_empty() {
            return Err(ConfigurationError::MissingSource.into());
        }
        let mut program = self
            .backend
            .create_program(session, source)
            .map_err(DispatchError::runtime(Stage::CreateProgram))?;
        let status = self.backend.build_program(session, &mut program, self.options);
        let log = self.line_ending.normalize(&status.log);
        emit_log(&log);
        if !status.is_success() {
            warn!(status = %status.status, "kernel source failed to build");
            return Err(DispatchError::Build { status: status.status, log });
        }
        self.finish(program, SourceKind::Text, log)
    }

    /// Load a precompiled binary for the session's device.
    pub fn load_from_binary(
        &self,
        session: &B::Session,
        bytes: &[u8],
    ) -> Result<ProgramArtifact<B::Program>> {
        let source = ProgramSource::Binary(bytes);
        if source.is_empty() {
            return Err(ConfigurationError::MissingSource.into());
        }
        let mut program = self
            .backend
            .create_program(session, source)
            .map_err(|status| DispatchError::BinaryLoad { status, log: String::new() })?;
        let status = self.backend.build_program(session, &mut program, self.options);
        let log = self.line_ending.normalize(&status.log);
        emit_log(&log);
        if !status.is_success() {
            warn!(status = %status.status, bytes = bytes.len(), "program binary rejected");
            return Err(DispatchError::BinaryLoad { status: status.status, log });
        }
        self.finish(program, SourceKind::Binary, log)
    }

    /// The program's first device binary.
    pub fn extract_binary(&self, artifact: &ProgramArtifact<B::Program>) -> Result<Vec<u8>> {
        let binaries = self
            .backend
            .program_binaries(&artifact.program)
            .map_err(DispatchError::runtime(Stage::ExtractBinary))?;
        match binaries.into_iter().next() {
            Some(binary) if !binary.is_empty() => {
                debug!(bytes = binary.len(), "extracted program binary");
                Ok(binary)
            }
            _ => Err(DispatchError::NotBuilt),
        }
    }

    fn finish(
        &self,
        program: B::Program,
        kind: SourceKind,
        build_log: String,
    ) -> Result<ProgramArtifact<B::Program>> {

        debug!(?kind, "program built");
        Ok(ProgramArtifact { program, kind, build_log })
    }
}

/// The build log side channel.
fn emit_log(log: &str) {
    if !log.trim().is_empty() {
        info!(target: "cldispatch::build_log", "{log}");
    }
}
