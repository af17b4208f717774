use std::collections::HashMap;
use std::str::FromStr;

use indexmap::IndexMap;

use super::EffectKind;
use super::FunctionNode;
use super::Materializer;
use super::MaterializerIdx;
use super::Policy;
use super::PolicyIdx;
use super::Runtime;
use super::RuntimeIdx;
use super::TypeIdx;
use super::TypeKind;
use super::TypeNode;
use super::Typegraph;
use crate::error::SchemaError;
use crate::json_ext::content_hash;
use crate::json_ext::Value;
use crate::runtimes::RuntimeKind;

/// Read-only lookup tables over a validated [`Typegraph`].
///
/// Building the index is the single validation boundary: a document that
/// indexes successfully has no dangling reference, so the accessors below
/// index the document arrays directly.
#[derive(Debug)]
pub struct SchemaIndex {
    typegraph: Typegraph,
    canonical_types: Vec<TypeIdx>,
    canonical_materializers: Vec<MaterializerIdx>,
    types_by_name: HashMap<String, TypeIdx>,
    runtime_kinds: Vec<RuntimeKind>,
}

impl SchemaIndex {
    pub fn new(typegraph: Typegraph) -> Result<Self, SchemaError> {
        validate_references(&typegraph)?;

        let runtime_kinds = typegraph
            .runtimes
            .iter()
            .map(|runtime| RuntimeKind::from_str(&runtime.name))
            .collect::<Result<Vec<_>, _>>()?;

        let canonical_materializers = intern(&typegraph.materializers);
        let canonical_types = dedup_types(&typegraph.types, &canonical_materializers);

        let mut types_by_name = HashMap::with_capacity(typegraph.types.len());
        for (idx, node) in typegraph.types.iter().enumerate() {
            let canonical = canonical_types[idx];
            match types_by_name.get(&node.title) {
                Some(existing) if *existing != canonical => {
                    return Err(SchemaError::DuplicateTypeName(node.title.clone()));
                }
                Some(_) => {}
                None => {
                    types_by_name.insert(node.title.clone(), canonical);
                }
            }
        }

        let deduped_types = canonical_types
            .iter()
            .enumerate()
            .filter(|(idx, canonical)| *idx as TypeIdx != **canonical)
            .count();
        let deduped_materializers = canonical_materializers
            .iter()
            .enumerate()
            .filter(|(idx, canonical)| *idx as MaterializerIdx != **canonical)
            .count();
        tracing::debug!(
            typegraph = typegraph.name(),
            types = typegraph.types.len(),
            deduped_types,
            deduped_materializers,
            "typegraph indexed"
        );

        Ok(Self {
            typegraph,
            canonical_types,
            canonical_materializers,
            types_by_name,
            runtime_kinds,
        })
    }

    pub fn typegraph(&self) -> &Typegraph {
        &self.typegraph
    }

    pub fn name(&self) -> &str {
        self.typegraph.name()
    }

    /// The canonical index of a type: structurally identical types share one.
    pub fn canonical(&self, idx: TypeIdx) -> TypeIdx {
        self.canonical_types[idx as usize]
    }

    pub fn resolve(&self, idx: TypeIdx) -> &TypeNode {
        &self.typegraph.types[self.canonical(idx) as usize]
    }

    pub fn function(&self, idx: TypeIdx) -> Option<&FunctionNode> {
        self.resolve(idx).as_function()
    }

    /// The canonical materializer of a function type.
    pub fn materializer_for(&self, function_idx: TypeIdx) -> Option<(MaterializerIdx, &Materializer)> {
        let function = self.function(function_idx)?;
        let canonical = self.canonical_materializers[function.materializer as usize];
        Some((canonical, self.materializer(canonical)))
    }

    pub fn materializer(&self, idx: MaterializerIdx) -> &Materializer {
        let canonical = self.canonical_materializers[idx as usize];
        &self.typegraph.materializers[canonical as usize]
    }

    /// The ordered policy chain of a type for `effect`.
    pub fn policies_for(&self, type_idx: TypeIdx, effect: EffectKind) -> Vec<PolicyIdx> {
        self.resolve(type_idx)
            .policies
            .iter()
            .filter_map(|indices| indices.for_effect(effect))
            .collect()
    }

    pub fn policy(&self, idx: PolicyIdx) -> &Policy {
        &self.typegraph.policies[idx as usize]
    }

    pub fn runtime(&self, idx: RuntimeIdx) -> &Runtime {
        &self.typegraph.runtimes[idx as usize]
    }

    pub fn runtime_kind(&self, idx: RuntimeIdx) -> RuntimeKind {
        self.runtime_kinds[idx as usize]
    }

    pub fn type_by_name(&self, title: &str) -> Option<TypeIdx> {
        self.types_by_name.get(title).copied()
    }

    /// Titles of the canonical types, each listed once.
    pub fn type_titles(&self) -> Vec<&str> {
        let mut titles: Vec<&str> = self.types_by_name.keys().map(String::as_str).collect();
        titles.sort_unstable();
        titles
    }

    pub fn root(&self) -> &TypeNode {
        self.resolve(0)
    }

    pub fn query_root(&self) -> Option<TypeIdx> {
        self.root_property("query")
    }

    pub fn mutation_root(&self) -> Option<TypeIdx> {
        self.root_property("mutation")
    }

    fn root_property(&self, name: &str) -> Option<TypeIdx> {
        self.properties(0)?.get(name).copied()
    }

    /// Properties of an object type.
    pub fn properties(&self, idx: TypeIdx) -> Option<&IndexMap<String, TypeIdx>> {
        match &self.resolve(idx).kind {
            TypeKind::Object { properties, .. } => Some(properties),
            _ => None,
        }
    }

    /// Key under which the runtime returns the visible field `field` of an
    /// object type.
    pub fn source_key<'a>(&'a self, idx: TypeIdx, field: &'a str) -> &'a str {
        match &self.resolve(idx).kind {
            TypeKind::Object { renames, .. } => {
                renames.get(field).map(String::as_str).unwrap_or(field)
            }
            _ => field,
        }
    }

    pub fn is_optional(&self, idx: TypeIdx) -> bool {
        matches!(self.resolve(idx).kind, TypeKind::Optional { .. })
    }

    /// The default value of an optional type.
    pub fn default_value(&self, idx: TypeIdx) -> Option<&Value> {
        match &self.resolve(idx).kind {
            TypeKind::Optional { default_value, .. } => default_value.as_ref(),
            _ => None,
        }
    }

    /// Strips optional and list wrappers.
    pub fn base_type(&self, mut idx: TypeIdx) -> TypeIdx {
        loop {
            match &self.resolve(idx).kind {
                TypeKind::Optional { item, .. } => idx = *item,
                TypeKind::List { items } => idx = *items,
                _ => return self.canonical(idx),
            }
        }
    }

    /// Strips optional wrappers only.
    pub fn non_optional(&self, mut idx: TypeIdx) -> TypeIdx {
        while let TypeKind::Optional { item, .. } = &self.resolve(idx).kind {
            idx = *item;
        }
        self.canonical(idx)
    }

    /// Variants of a union or either type, after stripping wrappers.
    pub fn variants(&self, idx: TypeIdx) -> Option<&[TypeIdx]> {
        match &self.resolve(self.base_type(idx)).kind {
            TypeKind::Union { any_of } => Some(any_of),
            TypeKind::Either { one_of } => Some(one_of),
            _ => None,
        }
    }
}

fn validate_references(typegraph: &Typegraph) -> Result<(), SchemaError> {
    let type_count = typegraph.types.len() as u32;
    let materializer_count = typegraph.materializers.len() as u32;
    let policy_count = typegraph.policies.len() as u32;
    let runtime_count = typegraph.runtimes.len() as u32;

    match typegraph.types.first() {
        Some(TypeNode {
            kind: TypeKind::Object { .. },
            ..
        }) => {}
        _ => return Err(SchemaError::InvalidRoot),
    }

    for (idx, node) in typegraph.types.iter().enumerate() {
        let from = idx as TypeIdx;
        let check_type = |to: TypeIdx| {
            if to < type_count {
                Ok(())
            } else {
                Err(SchemaError::DanglingType { from, to })
            }
        };

        for to in node.policies.iter().flat_map(|p| p.indices()) {
            if to >= policy_count {
                return Err(SchemaError::DanglingPolicy { from, to });
            }
        }

        match &node.kind {
            TypeKind::Object { properties, .. } => {
                properties.values().copied().try_for_each(check_type)?
            }
            TypeKind::List { items } => check_type(*items)?,
            TypeKind::Optional { item, .. } => check_type(*item)?,
            TypeKind::Union { any_of } => any_of.iter().copied().try_for_each(check_type)?,
            TypeKind::Either { one_of } => one_of.iter().copied().try_for_each(check_type)?,
            TypeKind::Function(function) => {
                check_type(function.input)?;
                check_type(function.output)?;
                if function.materializer >= materializer_count {
                    return Err(SchemaError::DanglingMaterializer {
                        from,
                        to: function.materializer,
                    });
                }
                if !matches!(
                    typegraph.types[function.input as usize].kind,
                    TypeKind::Object { .. }
                ) {
                    return Err(SchemaError::InvalidFunctionInput { function: from });
                }
            }
            TypeKind::Boolean {}
            | TypeKind::Integer { .. }
            | TypeKind::Float { .. }
            | TypeKind::String { .. }
            | TypeKind::File {} => {}
        }
    }

    for (idx, materializer) in typegraph.materializers.iter().enumerate() {
        if materializer.runtime >= runtime_count {
            return Err(SchemaError::DanglingRuntime {
                from: idx as u32,
                to: materializer.runtime,
            });
        }
    }

    for policy in &typegraph.policies {
        if let Some(to) = policy.materializer {
            if to >= materializer_count {
                return Err(SchemaError::DanglingPolicyMaterializer {
                    policy: policy.name.clone(),
                    to,
                });
            }
        }
    }

    Ok(())
}

/// Maps every item to the first item with the same content hash.
fn intern<T: serde::Serialize>(items: &[T]) -> Vec<u32> {
    let mut seen: HashMap<String, u32> = HashMap::with_capacity(items.len());
    items
        .iter()
        .enumerate()
        .map(|(idx, item)| *seen.entry(content_hash(item)).or_insert(idx as u32))
        .collect()
}

/// Interns types, rewriting references to their canonical index until the
/// mapping is stable so that identical subtrees built from distinct nodes
/// collapse as well.
fn dedup_types(types: &[TypeNode], materializers: &[MaterializerIdx]) -> Vec<TypeIdx> {
    let mut canonical = intern(types);
    for _ in 0..types.len() {
        let rewritten: Vec<TypeNode> = types
            .iter()
            .map(|node| with_canonical_references(node, &canonical, materializers))
            .collect();
        let next = intern(&rewritten);
        if next == canonical {
            break;
        }
        canonical = next;
    }
    canonical
}

fn with_canonical_references(
    node: &TypeNode,
    canonical: &[TypeIdx],
    materializers: &[MaterializerIdx],
) -> TypeNode {
    let c = |idx: &TypeIdx| canonical[*idx as usize];
    let mut node = node.clone();
    match &mut node.kind {
        TypeKind::Object { properties, .. } => {
            properties.values_mut().for_each(|idx| *idx = c(idx));
        }
        TypeKind::List { items } => *items = c(items),
        TypeKind::Optional { item, .. } => *item = c(item),
        TypeKind::Union { any_of } => any_of.iter_mut().for_each(|idx| *idx = c(idx)),
        TypeKind::Either { one_of } => one_of.iter_mut().for_each(|idx| *idx = c(idx)),
        TypeKind::Function(function) => {
            function.input = c(&function.input);
            function.output = c(&function.output);
            function.materializer = materializers[function.materializer as usize];
        }
        TypeKind::Boolean {}
        | TypeKind::Integer { .. }
        | TypeKind::Float { .. }
        | TypeKind::String { .. }
        | TypeKind::File {} => {}
    }
    node
}
