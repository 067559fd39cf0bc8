// SPDX-License-Identifier: MIT OR Apache-2.0

//! Scoped hook registration on language-model layers.
//!
//! Provides [`HookPoint`] (named locations in the language model's forward
//! pass), [`HookRegistry`] (the table a backend consults at each hook point)
//! and [`HookHandle`] (a registration that is removed when dropped).
//!
//! The confidence pipeline never registers hooks itself; the registry is
//! exposed so that experiments can observe or patch block inputs and
//! outputs without leaving callbacks permanently attached.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use candle_core::Tensor;

use crate::error::{LensError, Result};

// ---------------------------------------------------------------------------
// HookPoint
// ---------------------------------------------------------------------------

/// Named location in the language model where a hook can run.
///
/// Uses the `TransformerLens` naming convention via
/// [`Display`](std::fmt::Display) and [`FromStr`].
///
/// ```
/// use candle_vlm_lens::HookPoint;
///
/// let hook = HookPoint::ResidPost(5);
/// assert_eq!(hook.to_string(), "blocks.5.hook_resid_post");
///
/// let parsed: HookPoint = "blocks.5.hook_resid_post".parse().unwrap();
/// assert_eq!(parsed, hook);
/// ```
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HookPoint {
    /// After token embedding, with image features merged in (`hook_embed`).
    Embed,
    /// Input of decoder block `i` (`blocks.{i}.hook_resid_pre`).
    /// Equivalent to a forward pre-hook on that block.
    ResidPre(usize),
    /// Output of decoder block `i` (`blocks.{i}.hook_resid_post`).
    /// Equivalent to a forward hook on that block.
    ResidPost(usize),
    /// After the final norm, before the vocabulary head (`hook_final_norm`).
    FinalNorm,
    /// Backend-specific hook point not covered by the standard enum.
    Custom(String),
}

impl HookPoint {
    /// Decoder block index this hook point belongs to, if any.
    #[must_use]
    pub const fn layer(&self) -> Option<usize> {
        match self {
            Self::ResidPre(i) | Self::ResidPost(i) => Some(*i),
            Self::Embed | Self::FinalNorm | Self::Custom(_) => None,
        }
    }
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Embed => write!(f, "hook_embed"),
            Self::ResidPre(i) => write!(f, "blocks.{i}.hook_resid_pre"),
            Self::ResidPost(i) => write!(f, "blocks.{i}.hook_resid_post"),
            Self::FinalNorm => write!(f, "hook_final_norm"),
            Self::Custom(s) => write!(f, "{s}"),
        }
    }
}

/// Parse a `TransformerLens`-style string into a [`HookPoint`].
///
/// Unknown strings produce [`HookPoint::Custom`] rather than an error.
impl FromStr for HookPoint {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(parse_hook_string(s))
    }
}

impl From<&str> for HookPoint {
    fn from(s: &str) -> Self {
        parse_hook_string(s)
    }
}

/// Parse a hook string, falling back to [`HookPoint::Custom`] for unknown patterns.
fn parse_hook_string(s: &str) -> HookPoint {
    match s {
        "hook_embed" => return HookPoint::Embed,
        "hook_final_norm" => return HookPoint::FinalNorm,
        _ => {}
    }

    if let Some(rest) = s.strip_prefix("blocks.")
        && let Some((layer_str, suffix)) = rest.split_once('.')
        && let Ok(layer) = layer_str.parse::<usize>()
    {
        return match suffix {
            "hook_resid_pre" => HookPoint::ResidPre(layer),
            "hook_resid_post" => HookPoint::ResidPost(layer),
            _ => HookPoint::Custom(s.to_string()),
        };
    }

    HookPoint::Custom(s.to_string())
}

// ---------------------------------------------------------------------------
// HookRegistry
// ---------------------------------------------------------------------------

/// Callback run by a backend when the forward pass reaches a hook point.
///
/// Receives the activation at the hook point. Returning `Some(tensor)`
/// replaces the activation for the rest of the forward pass; `None`
/// leaves it untouched (observation only).
pub type HookFn = dyn Fn(&HookPoint, &Tensor) -> Result<Option<Tensor>> + Send + Sync;

/// One registered callback.
struct HookEntry {
    /// Registration id, unique within the registry.
    id: u64,
    /// Where the callback runs.
    point: HookPoint,
    /// The callback itself.
    callback: Arc<HookFn>,
}

/// Mutable registry state behind the mutex.
#[derive(Default)]
struct RegistryInner {
    /// Next id to hand out.
    next_id: u64,
    /// Callbacks in registration order.
    entries: Vec<HookEntry>,
}

/// Table of hook callbacks consulted by a backend during its forward pass.
///
/// Registrations are scoped: [`register`](Self::register) returns a
/// [`HookHandle`], and the callback is removed as soon as the handle is
/// dropped or [`HookHandle::remove`] is called.
///
/// ```
/// use candle_vlm_lens::{HookPoint, HookRegistry};
///
/// let registry = HookRegistry::new();
/// {
///     let _handle = registry.register(HookPoint::ResidPost(3), |_, t| Ok(Some((t * 2.0)?)));
///     assert_eq!(registry.len(), 1);
/// }
/// assert!(registry.is_empty());
/// ```
#[derive(Default, Clone)]
pub struct HookRegistry {
    /// Shared table; handles hold a weak reference to it.
    inner: Arc<Mutex<RegistryInner>>,
}

impl HookRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` at `point`.
    ///
    /// Callbacks at the same point run in registration order, each seeing
    /// the activation produced by the previous one.
    pub fn register<F>(&self, point: HookPoint, callback: F) -> HookHandle
    where
        F: Fn(&HookPoint, &Tensor) -> Result<Option<Tensor>> + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let id = inner.next_id;
        inner.next_id += 1;
        inner.entries.push(HookEntry {
            id,
            point: point.clone(),
            callback: Arc::new(callback),
        });
        HookHandle {
            id,
            point,
            registry: Arc::downgrade(&self.inner),
        }
    }

    /// Run every callback registered at `point` on `tensor`.
    ///
    /// The table lock is released before callbacks run, so a callback may
    /// itself register or drop hooks.
    ///
    /// # Errors
    ///
    /// Propagates the first error returned by a callback.
    pub fn apply(&self, point: &HookPoint, tensor: Tensor) -> Result<Tensor> {
        let callbacks: Vec<Arc<HookFn>> = {
            let inner = self
                .inner
                .lock()
                .map_err(|_| LensError::Hook("hook registry lock poisoned".into()))?;
            inner
                .entries
                .iter()
                .filter(|e| &e.point == point)
                .map(|e| Arc::clone(&e.callback))
                .collect()
        };

        let mut current = tensor;
        for callback in callbacks {
            if let Some(replaced) = callback(point, &current)? {
                current = replaced;
            }
        }
        Ok(current)
    }

    /// Whether any callback is registered at `point`.
    #[must_use]
    pub fn has_hooks_at(&self, point: &HookPoint) -> bool {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.entries.iter().any(|e| &e.point == point)
    }

    /// Number of live registrations.
    #[must_use]
    pub fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.entries.len()
    }

    /// Whether no hooks are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookRegistry")
            .field("len", &self.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// HookHandle
// ---------------------------------------------------------------------------

/// Scoped hook registration. The hook is removed when the handle drops.
#[must_use = "dropping the handle immediately removes the hook"]
#[derive(Debug)]
pub struct HookHandle {
    /// Registration id.
    id: u64,
    /// Hook point the callback runs at.
    point: HookPoint,
    /// Registry the callback lives in; weak so handles never keep it alive.
    registry: Weak<Mutex<RegistryInner>>,
}

impl HookHandle {
    /// Hook point this registration is attached to.
    #[must_use]
    pub const fn point(&self) -> &HookPoint {
        &self.point
    }

    /// Remove the hook now. Equivalent to dropping the handle.
    pub fn remove(self) {
        drop(self);
    }
}

impl Drop for HookHandle {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            let mut inner = registry.lock().unwrap_or_else(PoisonError::into_inner);
            inner.entries.retain(|e| e.id != self.id);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn hook_point_display_roundtrip() {
        let cases: Vec<(HookPoint, &str)> = vec![
            (HookPoint::Embed, "hook_embed"),
            (HookPoint::FinalNorm, "hook_final_norm"),
            (HookPoint::ResidPre(0), "blocks.0.hook_resid_pre"),
            (HookPoint::ResidPost(23), "blocks.23.hook_resid_post"),
        ];

        for (hook, expected_str) in cases {
            assert_eq!(hook.to_string(), expected_str, "Display failed for {hook:?}");
            let parsed: HookPoint = expected_str.parse().unwrap();
            assert_eq!(parsed, hook, "FromStr failed for {expected_str:?}");
        }
    }

    #[test]
    fn unknown_string_becomes_custom() {
        let hook: HookPoint = "vision_model.encoder.layers.3".parse().unwrap();
        assert_eq!(
            hook,
            HookPoint::Custom("vision_model.encoder.layers.3".to_string())
        );
        assert_eq!(hook.layer(), None);
        assert_eq!(HookPoint::ResidPre(7).layer(), Some(7));
    }

    #[test]
    fn handle_drop_removes_hook() {
        let registry = HookRegistry::new();
        let handle = registry.register(HookPoint::ResidPost(1), |_, _| Ok(None));
        let other = registry.register(HookPoint::ResidPre(1), |_, _| Ok(None));
        assert_eq!(registry.len(), 2);
        assert!(registry.has_hooks_at(&HookPoint::ResidPost(1)));

        drop(handle);
        assert_eq!(registry.len(), 1);
        assert!(!registry.has_hooks_at(&HookPoint::ResidPost(1)));

        other.remove();
        assert!(registry.is_empty());
    }

    #[test]
    fn apply_chains_replacements_in_order() {
        let registry = HookRegistry::new();
        let _double = registry.register(HookPoint::ResidPost(0), |_, t| Ok(Some((t * 2.0)?)));
        let _plus_one = registry.register(HookPoint::ResidPost(0), |_, t| Ok(Some((t + 1.0)?)));
        let _observer = registry.register(HookPoint::ResidPost(0), |_, _| Ok(None));

        let x = Tensor::ones(3, DType::F32, &Device::Cpu).unwrap();
        let out = registry.apply(&HookPoint::ResidPost(0), x).unwrap();
        assert_eq!(out.to_vec1::<f32>().unwrap(), vec![3.0, 3.0, 3.0]);

        // Other hook points are untouched.
        let y = Tensor::ones(2, DType::F32, &Device::Cpu).unwrap();
        let out = registry.apply(&HookPoint::ResidPost(1), y).unwrap();
        assert_eq!(out.to_vec1::<f32>().unwrap(), vec![1.0, 1.0]);
    }

    #[test]
    fn handle_outliving_registry_is_harmless() {
        let registry = HookRegistry::new();
        let handle = registry.register(HookPoint::Embed, |_, _| Ok(None));
        drop(registry);
        drop(handle);
    }

    #[test]
    fn callback_error_propagates() {
        let registry = HookRegistry::new();
        let _h = registry.register(HookPoint::FinalNorm, |_, _| {
            Err(LensError::Hook("boom".into()))
        });
        let x = Tensor::zeros(1, DType::F32, &Device::Cpu).unwrap();
        assert!(registry.apply(&HookPoint::FinalNorm, x).is_err());
    }
}
