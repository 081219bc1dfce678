use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::error::Error;
use crate::fmt::LossyStr;
use crate::params::Params;

/// Deferred work, run on the callback loop of the runner.
pub type Callback<'d> = Box<dyn FnOnce() + Send + 'd>;

/// Parses the parameters of one URC line.
///
/// Handlers run while the client is locked, so they must only parse. Anything
/// that talks to the module again goes into the returned [`Callback`].
pub type UrcHandler<'d> =
    Box<dyn FnMut(&mut Params<'_>) -> Result<Option<Callback<'d>>, Error> + Send + 'd>;

struct Binding<'d> {
    prefix: &'d str,
    handler: UrcHandler<'d>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UrcMatch {
    Found { index: usize, prefix_len: usize },
    /// More bytes are needed before the line can be told apart.
    Undecided,
    None,
}

/// Registered URC prefixes, kept in registration order.
pub(crate) struct UrcTable<'d> {
    bindings: Vec<Binding<'d>>,
}

impl<'d> UrcTable<'d> {
    pub(crate) const fn new() -> Self {
        Self {
            bindings: Vec::new(),
        }
    }

    /// Registers `handler` for `prefix`, replacing an earlier registration of
    /// the same prefix in place.
    pub(crate) fn set(&mut self, prefix: &'d str, handler: UrcHandler<'d>) {
        match self.bindings.iter_mut().find(|b| b.prefix == prefix) {
            Some(binding) => binding.handler = handler,
            None => self.bindings.push(Binding { prefix, handler }),
        }
    }

    pub(crate) fn remove(&mut self, prefix: &str) -> bool {
        let before = self.bindings.len();
        self.bindings.retain(|b| b.prefix != prefix);
        self.bindings.len() != before
    }

    /// Finds the binding for the line at the start of `data`.
    ///
    /// The longest matching prefix wins, the earliest registration breaks ties.
    pub(crate) fn find(&self, data: &[u8], line_complete: bool) -> UrcMatch {
        let mut best: Option<(usize, usize)> = None;
        let mut undecided = false;

        for (index, binding) in self.bindings.iter().enumerate() {
            let prefix = binding.prefix.as_bytes();
            match prefix_match(data, prefix, line_complete) {
                Some(true) if best.map_or(true, |(_, len)| prefix.len() > len) => {
                    best = Some((index, prefix.len()));
                }
                None => undecided = true,
                _ => {}
            }
        }

        match best {
            // A longer prefix that is still undecided could win.
            _ if undecided => UrcMatch::Undecided,
            Some((index, prefix_len)) => UrcMatch::Found { index, prefix_len },
            None => UrcMatch::None,
        }
    }

    /// Runs the handler at `index` on `line`, the line with its prefix removed.
    pub(crate) fn dispatch(
        &mut self,
        index: usize,
        line: &[u8],
        delimiter: u8,
    ) -> Option<Callback<'d>> {
        let binding = self.bindings.get_mut(index)?;
        let mut params = Params::line(line, delimiter);
        match (binding.handler)(&mut params) {
            Ok(callback) => callback,
            Err(e) => {
                warn!(
                    "Dropping malformed URC {:?}: {:?}",
                    LossyStr(binding.prefix.as_bytes()),
                    e
                );
                None
            }
        }
    }
}

/// Whether `data` starts with `pattern`. `None` while `data` is a strict
/// prefix of `pattern` and the line may still grow.
pub(crate) fn prefix_match(data: &[u8], pattern: &[u8], line_complete: bool) -> Option<bool> {
    if data.len() >= pattern.len() {
        Some(data.starts_with(pattern))
    } else if line_complete || !pattern.starts_with(data) {
        Some(false)
    } else {
        None
    }
}
