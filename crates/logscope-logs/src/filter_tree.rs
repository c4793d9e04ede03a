//! Hierarchical drill-down filter
//!
//! The tree partitions the store by successive grouping properties. Every
//! layer carries a tri-state "show layer" flag and six tri-state level flags;
//! unset flags inherit from the parent layer. The tree compiles to a single
//! predicate and round-trips its overrides through a compact string codec.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

use logscope_types::{LogItem, LogLevel, PropertyKind};

use crate::catalog::PropertyCatalog;
use crate::query::Expr;
use crate::store::LogStore;

/// Path segment used for a null property value in settings keys
pub const NULL_VALUE_TOKEN: &str = "~<NULL>~";

/// Separator of path segments in settings keys
const KEY_SEPARATOR: &str = "|";

/// Length of an encoded layer: show-layer flag plus one flag per level
pub const ENCODED_LAYER_LEN: usize = LogLevel::COUNT + 1;

/// Tri-state visibility flag
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum Visibility {
    /// Use the parent's value
    #[default]
    Inherit,
    Show,
    Hide,
}

impl Visibility {
    pub fn as_override(self) -> Option<bool> {
        match self {
            Self::Inherit => None,
            Self::Show => Some(true),
            Self::Hide => Some(false),
        }
    }

    pub fn to_char(self) -> char {
        match self {
            Self::Inherit => '-',
            Self::Show => '1',
            Self::Hide => '0',
        }
    }

    /// Decode a settings character; anything unknown means inherit
    pub fn from_char(c: char) -> Self {
        match c {
            '1' => Self::Show,
            '0' => Self::Hide,
            _ => Self::Inherit,
        }
    }

    /// Resolve against an inherited value
    fn resolve(self, inherited: bool) -> bool {
        self.as_override().unwrap_or(inherited)
    }
}

impl From<Option<bool>> for Visibility {
    fn from(value: Option<bool>) -> Self {
        match value {
            None => Self::Inherit,
            Some(true) => Self::Show,
            Some(false) => Self::Hide,
        }
    }
}

/// Index of a layer in its tree
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LayerId(usize);

impl LayerId {
    pub const ROOT: LayerId = LayerId(0);
}

/// One node of the filter tree
#[derive(Clone, Debug)]
pub struct FilterLayer {
    /// Grouping property, `None` for the root
    property: Option<String>,

    /// Partition value; `None` groups items where the property is missing or null
    value: Option<String>,

    /// 0 for the root, 1 for the first grouping property and so on
    depth: usize,

    children: Vec<LayerId>,

    show_layer: Visibility,

    /// Indexed by level ordinal
    show_levels: [Visibility; LogLevel::COUNT],

    /// Presentation state only
    expanded: bool,
}

impl FilterLayer {
    fn new(property: Option<String>, value: Option<String>, depth: usize) -> Self {
        let mut layer = Self {
            property,
            value,
            depth,
            children: Vec::new(),
            show_layer: Visibility::Inherit,
            show_levels: [Visibility::Inherit; LogLevel::COUNT],
            expanded: true,
        };
        layer.show_layer = layer.default_show_layer();
        layer.show_levels = [layer.default_show_level(); LogLevel::COUNT];
        layer
    }

    pub fn property(&self) -> Option<&str> {
        self.property.as_deref()
    }

    pub fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn children(&self) -> &[LayerId] {
        &self.children
    }

    pub fn show_layer(&self) -> Visibility {
        self.show_layer
    }

    pub fn show_level(&self, level: LogLevel) -> Visibility {
        self.show_levels[level.ordinal()]
    }

    pub fn is_expanded(&self) -> bool {
        self.expanded
    }

    /// Below the first grouping level, "show layer" may inherit
    pub fn is_show_layer_tri_state(&self) -> bool {
        self.depth > 1
    }

    /// Every layer but the root may inherit level flags
    pub fn is_level_tri_state(&self) -> bool {
        self.depth > 0
    }

    fn default_show_layer(&self) -> Visibility {
        if self.is_show_layer_tri_state() {
            Visibility::Inherit
        } else {
            Visibility::Show
        }
    }

    fn default_show_level(&self) -> Visibility {
        if self.is_level_tri_state() {
            Visibility::Inherit
        } else {
            Visibility::Show
        }
    }

    /// Own flags at default, ignoring children
    fn own_flags_default(&self) -> bool {
        (self.depth == 0 || self.show_layer == self.default_show_layer())
            && self.show_levels.iter().all(|v| *v == self.default_show_level())
    }

    fn encode(&self) -> String {
        std::iter::once(self.show_layer)
            .chain(self.show_levels)
            .map(Visibility::to_char)
            .collect()
    }
}

/// Hierarchical filter over the store's grouping properties
pub struct FilterTree {
    /// Requested grouping properties, in order
    layer_properties: Vec<String>,

    /// Arena of layers, the root at index 0
    layers: Vec<FilterLayer>,

    /// Bumped on every visibility change or rebuild
    revision: watch::Sender<u64>,

    batch_depth: usize,

    /// A change happened inside a batch
    pending: bool,
}

impl FilterTree {
    pub fn new() -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            layer_properties: Vec::new(),
            layers: vec![FilterLayer::new(None, None, 0)],
            revision,
            batch_depth: 0,
            pending: false,
        }
    }

    pub fn layer_properties(&self) -> &[String] {
        &self.layer_properties
    }

    /// Set the requested grouping properties; takes effect on the next rebuild
    pub fn set_layer_properties(&mut self, properties: Vec<String>) {
        self.layer_properties = properties;
    }

    /// Grouping properties the current tree was actually built with
    pub fn actual_layer_properties(&self) -> Vec<String> {
        let mut properties = Vec::new();
        let mut layer = &self.layers[LayerId::ROOT.0];
        while let Some(&child) = layer.children.first() {
            layer = &self.layers[child.0];
            if let Some(property) = &layer.property {
                properties.push(property.clone());
            }
        }
        properties
    }

    pub fn root(&self) -> &FilterLayer {
        &self.layers[LayerId::ROOT.0]
    }

    pub fn layer(&self, id: LayerId) -> Option<&FilterLayer> {
        self.layers.get(id.0)
    }

    /// Number of layers including the root
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.len() == 1
    }

    /// Find a layer by its chain of partition values below the root
    pub fn find(&self, path: &[Option<&str>]) -> Option<LayerId> {
        let mut id = LayerId::ROOT;
        for value in path {
            id = *self.layers[id.0]
                .children
                .iter()
                .find(|c| self.layers[c.0].value.as_deref() == *value)?;
        }
        Some(id)
    }

    /// Subscribe to change notifications; the value is a revision counter
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    pub fn revision(&self) -> u64 {
        *self.revision.borrow()
    }

    /// Run several edits with a single change notification at the end
    pub fn batch<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        self.batch_depth += 1;
        let result = f(self);
        self.batch_depth -= 1;
        if self.batch_depth == 0 && self.pending {
            self.pending = false;
            self.notify();
        }
        result
    }

    fn changed(&mut self) {
        if self.batch_depth > 0 {
            self.pending = true;
        } else {
            self.notify();
        }
    }

    fn notify(&self) {
        self.revision.send_modify(|r| *r += 1);
    }

    // ------------------------------------------------------------------------
    // Editing
    // ------------------------------------------------------------------------

    /// Set the "show layer" flag; binary layers treat `Inherit` as `Show`
    ///
    /// Returns whether anything changed.
    pub fn set_show_layer(&mut self, id: LayerId, visibility: Visibility) -> bool {
        let Some(layer) = self.layers.get_mut(id.0) else {
            return false;
        };
        let visibility = if !layer.is_show_layer_tri_state() && visibility == Visibility::Inherit {
            Visibility::Show
        } else {
            visibility
        };
        if layer.show_layer == visibility {
            return false;
        }
        layer.show_layer = visibility;
        self.changed();
        true
    }

    /// Set one level flag; the root treats `Inherit` as `Show`
    pub fn set_show_level(&mut self, id: LayerId, level: LogLevel, visibility: Visibility) -> bool {
        let Some(layer) = self.layers.get_mut(id.0) else {
            return false;
        };
        let visibility = if !layer.is_level_tri_state() && visibility == Visibility::Inherit {
            Visibility::Show
        } else {
            visibility
        };
        let slot = &mut layer.show_levels[level.ordinal()];
        if *slot == visibility {
            return false;
        }
        *slot = visibility;
        self.changed();
        true
    }

    pub fn set_expanded(&mut self, id: LayerId, expanded: bool) {
        if let Some(layer) = self.layers.get_mut(id.0) {
            layer.expanded = expanded;
        }
    }

    pub fn expand_collapse_all(&mut self, expanded: bool) {
        for layer in &mut self.layers {
            layer.expanded = expanded;
        }
    }

    /// Whether a layer and all its descendants are at their default flags
    pub fn is_default(&self, id: LayerId) -> bool {
        let layer = &self.layers[id.0];
        layer.own_flags_default() && layer.children.iter().all(|c| self.is_default(*c))
    }

    // ------------------------------------------------------------------------
    // Building
    // ------------------------------------------------------------------------

    /// Rebuild the layers from the given items
    ///
    /// Grouping properties that are unknown to the catalog or were never seen
    /// with a string value are skipped. The root keeps its level flags, all
    /// other overrides are dropped.
    pub(crate) fn rebuild(&mut self, catalog: &PropertyCatalog, items: &[Arc<LogItem>]) {
        let effective: Vec<String> = self
            .layer_properties
            .iter()
            .filter(|p| catalog.has_kind(p, PropertyKind::String))
            .cloned()
            .collect();

        self.layers.truncate(1);
        self.layers[LayerId::ROOT.0].children.clear();

        let all: Vec<&LogItem> = items.iter().map(|i| i.as_ref()).collect();
        self.fill(LayerId::ROOT, &effective, all);

        debug!(
            requested = self.layer_properties.len(),
            effective = effective.len(),
            layers = self.layers.len(),
            "Rebuilt filter tree"
        );
        self.changed();
    }

    fn fill(&mut self, parent: LayerId, properties: &[String], items: Vec<&LogItem>) {
        let depth = self.layers[parent.0].depth;
        let Some(property) = properties.get(depth) else {
            return;
        };

        // Stable partition in first-seen order
        let mut groups: Vec<(Option<String>, Vec<&LogItem>)> = Vec::new();
        let mut index: HashMap<Option<String>, usize> = HashMap::new();
        for item in items {
            let key = item.scalar_string(property);
            match index.get(&key) {
                Some(&n) => groups[n].1.push(item),
                None => {
                    index.insert(key.clone(), groups.len());
                    groups.push((key, vec![item]));
                }
            }
        }

        for (value, members) in groups {
            let id = LayerId(self.layers.len());
            self.layers
                .push(FilterLayer::new(Some(property.clone()), value, depth + 1));
            self.layers[parent.0].children.push(id);
            self.fill(id, properties, members);
        }
    }

    // ------------------------------------------------------------------------
    // Compiling
    // ------------------------------------------------------------------------

    /// Compile the tree to a predicate; `None` when the tree is at default
    pub fn compiled_filter(&self) -> Option<Expr> {
        if self.is_default(LayerId::ROOT) {
            return None;
        }

        let root = self.root();
        let levels = root.show_levels.map(|v| v.resolve(true));

        if root.children.iter().all(|c| self.is_default(*c)) {
            return Some(level_clause(&levels).unwrap_or(Expr::Const(false)));
        }

        let mut terms = Vec::new();
        let mut path = Vec::new();
        for &child in &root.children {
            self.collect_terms(child, &mut path, true, levels, &mut terms);
        }
        if terms.is_empty() {
            return Some(Expr::Const(false));
        }
        Some(Expr::or(terms))
    }

    /// Textual form of [`FilterTree::compiled_filter`], empty when at default
    pub fn compiled_filter_string(&self) -> String {
        self.compiled_filter()
            .map(|e| e.to_string())
            .unwrap_or_default()
    }

    fn collect_terms<'a>(
        &'a self,
        id: LayerId,
        path: &mut Vec<(&'a str, Option<&'a str>)>,
        visible: bool,
        mut levels: [bool; LogLevel::COUNT],
        terms: &mut Vec<Expr>,
    ) {
        let layer = &self.layers[id.0];
        let pushed = match layer.property.as_deref() {
            Some(property) => {
                path.push((property, layer.value.as_deref()));
                true
            }
            None => false,
        };

        let visible = layer.show_layer.resolve(visible);
        for (shown, flag) in levels.iter_mut().zip(layer.show_levels) {
            *shown = flag.resolve(*shown);
        }

        if layer.children.iter().any(|c| !self.is_default(*c)) {
            for &child in &layer.children {
                self.collect_terms(child, path, visible, levels, terms);
            }
        } else if visible && levels.iter().any(|l| *l) {
            let mut parts: Vec<Expr> = path
                .iter()
                .map(|(property, value)| Expr::property_equals(property, *value))
                .collect();
            parts.extend(level_clause(&levels).filter(|_| levels.iter().any(|l| !*l)));
            terms.push(Expr::and(parts));
        }

        if pushed {
            path.pop();
        }
    }

    // ------------------------------------------------------------------------
    // Settings codec
    // ------------------------------------------------------------------------

    /// Encode every non-default layer, keyed by its pipe-joined value path
    ///
    /// The root is keyed by the empty string. Values are one character for the
    /// show-layer flag followed by one per level (`1`, `0` or `-`).
    pub fn encode_layers(&self) -> BTreeMap<String, String> {
        let mut settings = BTreeMap::new();
        let mut path = Vec::new();
        self.encode_layer(LayerId::ROOT, &mut path, &mut settings);
        settings
    }

    fn encode_layer<'a>(&'a self, id: LayerId, path: &mut Vec<&'a str>, settings: &mut BTreeMap<String, String>) {
        let layer = &self.layers[id.0];
        let pushed = layer.property.is_some();
        if pushed {
            path.push(layer.value.as_deref().unwrap_or(NULL_VALUE_TOKEN));
        }

        if !self.is_default(id) {
            settings.insert(path.join(KEY_SEPARATOR), layer.encode());
        }
        for &child in &layer.children {
            self.encode_layer(child, path, settings);
        }

        if pushed {
            path.pop();
        }
    }

    /// Restore layer flags from encoded settings
    ///
    /// Layers whose path has no entry keep their current flags. Entries shorter
    /// than [`ENCODED_LAYER_LEN`] are ignored. Emits at most one notification.
    pub fn apply_layers(&mut self, settings: &BTreeMap<String, String>) {
        let mut updates = Vec::new();
        let mut path = Vec::new();
        self.collect_updates(LayerId::ROOT, &mut path, settings, &mut updates);

        self.batch(|tree| {
            for (id, code) in updates {
                let mut flags = code.chars().map(Visibility::from_char);
                if let Some(show_layer) = flags.next() {
                    tree.set_show_layer(id, show_layer);
                }
                for (level, visibility) in LogLevel::ALL.into_iter().zip(flags) {
                    tree.set_show_level(id, level, visibility);
                }
            }
        });
    }

    fn collect_updates<'a>(
        &'a self,
        id: LayerId,
        path: &mut Vec<&'a str>,
        settings: &BTreeMap<String, String>,
        updates: &mut Vec<(LayerId, String)>,
    ) {
        let layer = &self.layers[id.0];
        let pushed = layer.property.is_some();
        if pushed {
            path.push(layer.value.as_deref().unwrap_or(NULL_VALUE_TOKEN));
        }

        if let Some(code) = settings.get(&path.join(KEY_SEPARATOR))
            && code.chars().count() >= ENCODED_LAYER_LEN
        {
            updates.push((id, code.clone()));
        }
        for &child in &layer.children {
            self.collect_updates(child, path, settings, updates);
        }

        if pushed {
            path.pop();
        }
    }
}

impl Default for FilterTree {
    fn default() -> Self {
        Self::new()
    }
}

/// `Level in (...)` for the visible levels, `None` if no level is visible
fn level_clause(levels: &[bool; LogLevel::COUNT]) -> Option<Expr> {
    let visible: Vec<LogLevel> = LogLevel::ALL
        .into_iter()
        .filter(|l| levels[l.ordinal()])
        .collect();
    if visible.is_empty() {
        None
    } else {
        Some(Expr::level_in(visible))
    }
}

impl LogStore {
    /// Rebuild a filter tree from the current store contents
    pub fn rebuild_filter_tree(&self, tree: &mut FilterTree) {
        let inner = self.read();
        tree.rebuild(&inner.catalog, &inner.items);
    }
}
