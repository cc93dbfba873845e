//! The immutable, reference-counted handler rule.

use crate::event::EventMask;
use crate::pattern::PatternSet;
use std::rc::Rc;
use std::time::Duration;

bitflags::bitflags! {
    /// Flags recognised in the `option (...)` configuration clause.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct HandlerFlags: u8 {
        const NOWAIT  = 0b0001;
        const STDOUT  = 0b0010;
        const STDERR  = 0b0100;
        const SHELL   = 0b1000;
    }
}

/// Credentials a handler's child process should assume. `uid == 0` means
/// "don't change credentials".
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub uid: u32,
    /// Supplementary gids, including the primary gid, in the order
    /// `setgroups` should receive them. `gids[0]` is passed to `setgid`.
    pub gids: Vec<u32>,
}

impl Credentials {
    pub fn none() -> Self {
        Credentials::default()
    }

    pub fn has_identity_change(&self) -> bool {
        self.uid != 0
    }
}

/// One rule: event mask, filename patterns, command, credentials, timeout,
/// flags. Immutable after construction; shared via [`Rc`] by every directory
/// node it applies to.
#[derive(Debug)]
pub struct Handler {
    pub mask: EventMask,
    pub patterns: PatternSet,
    pub command: String,
    pub credentials: Credentials,
    pub timeout: Duration,
    pub flags: HandlerFlags,
    /// Extra environment bindings from the configuration's `environ`
    /// clause, applied on top of the daemon's own environment and below
    /// the `DIREVENT_*` event bindings (which always win on conflict).
    pub environ: Vec<(String, String)>,
}

impl std::fmt::Debug for PatternSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatternSet")
            .field("is_empty", &self.is_empty())
            .finish()
    }
}

impl Handler {
    /// A handler whose event mask is "accept everything" and whose pattern
    /// set is empty ("accept all names"), suitable as a starting point for
    /// the configuration collaborator to fill in before calling
    /// [`Handler::finalize`].
    pub fn builder() -> HandlerBuilder {
        HandlerBuilder::default()
    }
}

/// Mutable scratch handler accumulated by the configuration collaborator,
/// then flushed into an immutable, shareable [`Handler`].
#[derive(Default)]
pub struct HandlerBuilder {
    mask: EventMask,
    patterns: PatternSet,
    command: Option<String>,
    credentials: Credentials,
    timeout: Option<Duration>,
    flags: HandlerFlags,
    environ: Vec<(String, String)>,
}

impl HandlerBuilder {
    pub fn mask(&mut self, mask: EventMask) -> &mut Self {
        self.mask = mask;
        self
    }

    pub fn add_pattern(&mut self, spec: &str) -> Result<&mut Self, crate::pattern::PatternError> {
        self.patterns.push(spec)?;
        Ok(self)
    }

    pub fn command(&mut self, command: impl Into<String>) -> &mut Self {
        self.command = Some(command.into());
        self
    }

    pub fn credentials(&mut self, credentials: Credentials) -> &mut Self {
        self.credentials = credentials;
        self
    }

    pub fn timeout(&mut self, secs: u64) -> &mut Self {
        self.timeout = Some(Duration::from_secs(secs));
        self
    }

    pub fn flags(&mut self, flags: HandlerFlags) -> &mut Self {
        self.flags = flags;
        self
    }

    pub fn environ(&mut self, environ: Vec<(String, String)>) -> &mut Self {
        self.environ = environ;
        self
    }

    /// Consumes the scratch handler, filling in the empty-mask-means-all-events
    /// rule, and wraps it for sharing.
    pub fn finalize(self) -> Result<Rc<Handler>, &'static str> {
        let command = self.command.ok_or("handler has no command")?;
        let mut mask = self.mask;
        mask.fill_if_empty();
        Ok(Rc::new(Handler {
            mask,
            patterns: self.patterns,
            command,
            credentials: self.credentials,
            timeout: self.timeout.unwrap_or(Duration::from_secs(crate::DEFAULT_TIMEOUT_SECS)),
            flags: self.flags,
            environ: self.environ,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{GenericEvent, GenericMask};

    #[test]
    fn finalize_fills_empty_mask_to_all_generic_events() {
        let handler = Handler::builder().command("true").finalize().unwrap();
        assert_eq!(handler.mask.generic, GenericMask::ALL);
    }

    #[test]
    fn finalize_requires_a_command() {
        assert!(Handler::builder().finalize().is_err());
    }

    #[test]
    fn finalize_preserves_explicit_mask() {
        let mut mask = EventMask::default();
        mask.generic.insert(GenericEvent::Write);
        let handler = Handler::builder()
            .command("true")
            .mask(mask)
            .finalize()
            .unwrap();
        assert!(handler.mask.generic.contains(GenericEvent::Write));
        assert!(!handler.mask.generic.contains(GenericEvent::Create));
    }
}
