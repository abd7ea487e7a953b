//! Registry keeping control-plane and data-plane units disjoint.

use crate::IsolationError;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Category of an execution unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Layer {
    /// Coordination traffic
    Control,
    /// Stream sample I/O
    Data,
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Layer::Control => write!(f, "control"),
            Layer::Data => write!(f, "data"),
        }
    }
}

#[derive(Debug, Default)]
struct Layers {
    control: HashSet<String>,
    data: HashSet<String>,
}

impl Layers {
    fn set(&self, layer: Layer) -> &HashSet<String> {
        match layer {
            Layer::Control => &self.control,
            Layer::Data => &self.data,
        }
    }

    fn set_mut(&mut self, layer: Layer) -> &mut HashSet<String> {
        match layer {
            Layer::Control => &mut self.control,
            Layer::Data => &mut self.data,
        }
    }
}

/// Index of active unit ids per layer.
///
/// One instance is created per process-level owner and handed to whatever
/// spawns units; clones share the same index.
#[derive(Debug, Clone, Default)]
pub struct LayerRegistry {
    layers: Arc<Mutex<Layers>>,
}

impl LayerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Layers> {
        self.layers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `id` in `layer`. The returned guard unregisters on drop.
    pub fn register(&self, id: impl Into<String>, layer: Layer) -> Result<Registration, IsolationError> {
        let id = id.into();
        let other = match layer {
            Layer::Control => Layer::Data,
            Layer::Data => Layer::Control,
        };

        let mut layers = self.lock();
        if layers.set(other).contains(&id) {
            return Err(IsolationError::Overlap { id, existing: other });
        }
        if !layers.set_mut(layer).insert(id.clone()) {
            return Err(IsolationError::Duplicate { id, layer });
        }
        drop(layers);

        debug!("Registered {} unit {}", layer, id);
        Ok(Registration {
            registry: self.clone(),
            id,
            layer,
        })
    }

    fn unregister(&self, id: &str, layer: Layer) {
        if self.lock().set_mut(layer).remove(id) {
            debug!("Unregistered {} unit {}", layer, id);
        }
    }

    /// Ids registered in `layer`, sorted
    pub fn units(&self, layer: Layer) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().set(layer).iter().cloned().collect();
        ids.sort();
        ids
    }

    /// Layer `id` is registered in
    pub fn layer_of(&self, id: &str) -> Option<Layer> {
        let layers = self.lock();
        if layers.control.contains(id) {
            Some(Layer::Control)
        } else if layers.data.contains(id) {
            Some(Layer::Data)
        } else {
            None
        }
    }

    /// Whether the two layers share no id
    pub fn is_disjoint(&self) -> bool {
        let layers = self.lock();
        layers.control.is_disjoint(&layers.data)
    }
}

/// Active registration of a unit; unregisters when dropped
#[derive(Debug)]
pub struct Registration {
    registry: LayerRegistry,
    id: String,
    layer: Layer,
}

impl Registration {
    /// Registered unit id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Layer of the unit
    pub fn layer(&self) -> Layer {
        self.layer
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.unregister(&self.id, self.layer);
    }
}
