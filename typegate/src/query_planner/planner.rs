//! Compiles a GraphQL document into a [`QueryPlan`].
//!
//! Planning happens in two passes. The first pass walks the selection against
//! the schema index: it expands fragments, merges fields sharing a response
//! key, binds arguments and computes a structural hash for every selected
//! field. The second pass allocates stage ids, collapsing structurally
//! identical siblings into one stage, wires the dependencies between sibling
//! stages and records the response shape.

use std::collections::HashMap;
use std::collections::HashSet;
use std::fmt;

use apollo_compiler::ast;
use apollo_compiler::Node;
use indexmap::IndexMap;
use serde::Serialize;

use super::stage::get_child_id;
use super::stage::ArgumentBinding;
use super::stage::Stage;
use super::stage::StageId;
use super::stage::StageKind;
use super::stage::BRANCH_PREFIX;
use super::OperationKind;
use crate::error::PlanningError;
use crate::json_ext::content_hash;
use crate::json_ext::Object;
use crate::json_ext::Value;
use crate::runtimes::RuntimeKind;
use crate::typegraph::EffectKind;
use crate::typegraph::FunctionNode;
use crate::typegraph::Injection;
use crate::typegraph::MaterializerIdx;
use crate::typegraph::PolicyIdx;
use crate::typegraph::SchemaIndex;
use crate::typegraph::TypeIdx;
use crate::typegraph::TypeKind;

const TYPENAME: &str = "__typename";

/// Position of a response key in the requested selection.
///
/// Several shape nodes may point to the same stage when identical selections
/// were deduplicated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShapeNode {
    /// `None` for polymorphic branches.
    pub response_key: Option<String>,
    pub stage: StageId,
    pub children: Vec<ShapeNode>,
}

/// The executable form of a query.
#[derive(Clone, Debug)]
pub struct QueryPlan {
    pub operation_kind: OperationKind,
    pub stages: IndexMap<StageId, Stage>,
    pub roots: Vec<StageId>,
    pub shape: Vec<ShapeNode>,
    /// Sum of the weights of the function stages.
    pub rate_weight: u64,
}

impl QueryPlan {
    pub fn stage(&self, id: &StageId) -> Option<&Stage> {
        self.stages.get(id)
    }

    pub fn function_stages(&self) -> impl Iterator<Item = &Stage> {
        self.stages.values().filter(|stage| stage.is_function())
    }
}

impl fmt::Display for QueryPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} (weight {}) {{", self.operation_kind, self.rate_weight)?;
        for stage in self.stages.values() {
            let indent = "  ".repeat(stage.id.depth());
            let kind = match &stage.kind {
                StageKind::Function { runtime, .. } => format!("function @{runtime}"),
                StageKind::Field { source_key } => format!("field {source_key}"),
                StageKind::Typename { title } => format!("typename {title}"),
                StageKind::Branch { title, .. } => format!("branch {title}"),
            };
            write!(f, "{indent}{} [{kind}]", stage.id)?;
            if !stage.depends_on.is_empty() {
                let deps: Vec<&str> = stage.depends_on.iter().map(StageId::as_str).collect();
                write!(f, " after {}", deps.join(", "))?;
            }
            writeln!(f)?;
        }
        write!(f, "}}")
    }
}

/// Plans queries against one schema index.
pub struct QueryPlanner<'a> {
    schema: &'a SchemaIndex,
    max_depth: usize,
}

impl<'a> QueryPlanner<'a> {
    pub fn new(schema: &'a SchemaIndex, max_depth: usize) -> Self {
        Self { schema, max_depth }
    }

    /// Plans the selected operation of `document`.
    pub fn plan(
        &self,
        document: &str,
        operation_name: Option<&str>,
        variables: &Object,
        effect: Option<EffectKind>,
    ) -> Result<QueryPlan, PlanningError> {
        let document = parse(document)?;
        let operation = select_operation(&document, operation_name)?;
        let operation_kind = OperationKind::from(operation.operation_type);
        let root = match operation_kind {
            OperationKind::Query => self.schema.query_root(),
            OperationKind::Mutation => self.schema.mutation_root(),
            OperationKind::Subscription => None,
        }
        .ok_or_else(|| PlanningError::UnsupportedOperation {
            kind: operation_kind.to_string(),
        })?;

        let fragments = document
            .definitions
            .iter()
            .filter_map(|definition| match definition {
                ast::Definition::FragmentDefinition(fragment) => {
                    Some((fragment.name.as_str(), fragment))
                }
                _ => None,
            })
            .collect();

        let mut context = PlanningContext {
            schema: self.schema,
            max_depth: self.max_depth,
            operation_kind,
            effect_override: effect,
            fragments,
            defined_variables: operation
                .variables
                .iter()
                .map(|definition| definition.name.as_str())
                .collect(),
            variables: Object::new(),
        };
        context.variables = context.coerce_variables(&operation.variables, variables)?;

        let nodes = context.plan_object(
            self.schema.non_optional(root),
            &[operation.selection_set.as_slice()],
            1,
            EffectKind::Read,
        )?;

        let mut allocator = Allocator::default();
        let shape = allocator.place_group(&StageId::root(), nodes)?;
        let roots = unique_stages(&shape);
        let rate_weight = allocator
            .stages
            .values()
            .map(|stage| stage.rate_weight())
            .sum();

        Ok(QueryPlan {
            operation_kind,
            stages: allocator.stages,
            roots,
            shape,
            rate_weight,
        })
    }
}

fn parse(document: &str) -> Result<ast::Document, PlanningError> {
    ast::Document::parse(document, "query.graphql").map_err(|with_errors| {
        PlanningError::Parse {
            reason: with_errors.errors.to_string(),
        }
    })
}

/// Names of the operations of a document.
pub(crate) fn operation_names(document: &str) -> Result<Vec<String>, PlanningError> {
    Ok(parse(document)?
        .definitions
        .iter()
        .filter_map(|definition| match definition {
            ast::Definition::OperationDefinition(operation) => {
                operation.name.as_ref().map(|name| name.to_string())
            }
            _ => None,
        })
        .collect())
}

fn select_operation<'d>(
    document: &'d ast::Document,
    operation_name: Option<&str>,
) -> Result<&'d ast::OperationDefinition, PlanningError> {
    let mut operations = document
        .definitions
        .iter()
        .filter_map(|definition| match definition {
            ast::Definition::OperationDefinition(operation) => Some(&**operation),
            _ => None,
        });
    match operation_name {
        Some(name) => operations
            .find(|operation| operation.name.as_ref().is_some_and(|n| n.as_str() == name))
            .ok_or_else(|| PlanningError::UnknownOperation {
                name: name.to_string(),
            }),
        None => {
            let first = operations.next().ok_or(PlanningError::NoOperation)?;
            if operations.next().is_some() {
                return Err(PlanningError::AmbiguousOperation);
            }
            Ok(first)
        }
    }
}

/// A field of a selection set once fragments are expanded.
struct CollectedField<'d> {
    name: &'d str,
    alias: Option<&'d str>,
    arguments: &'d [Node<ast::Argument>],
    selection_sets: Vec<&'d [ast::Selection]>,
}

/// A planned field, before stage ids are allocated.
#[derive(Debug)]
struct PlannedNode {
    response_key: String,
    field_name: String,
    kind: StageKind,
    type_idx: TypeIdx,
    effect: EffectKind,
    policies: Vec<PolicyIdx>,
    check_policies: bool,
    children: Vec<PlannedNode>,
    hash: String,
}

impl PlannedNode {
    /// The id segment this node would like to use.
    fn segment(&self) -> String {
        match &self.kind {
            StageKind::Branch { title, .. } => format!("{BRANCH_PREFIX}{title}"),
            _ => self.field_name.clone(),
        }
    }
}

#[derive(Serialize)]
struct StructuralKey<'a> {
    field: &'a str,
    kind: KindKey<'a>,
    children: Vec<&'a str>,
}

#[derive(Serialize)]
enum KindKey<'a> {
    Function {
        function: TypeIdx,
        materializer: MaterializerIdx,
        arguments: &'a IndexMap<String, ArgumentBinding>,
    },
    Field(&'a str),
    Typename(&'a str),
    Branch(TypeIdx),
}

fn structural_hash(field: &str, kind: &StageKind, children: &[PlannedNode]) -> String {
    let mut child_hashes: Vec<&str> = children.iter().map(|child| child.hash.as_str()).collect();
    child_hashes.sort_unstable();
    child_hashes.dedup();
    let kind = match kind {
        StageKind::Function {
            function,
            materializer,
            arguments,
            ..
        } => KindKey::Function {
            function: *function,
            materializer: *materializer,
            arguments,
        },
        StageKind::Field { source_key } => KindKey::Field(source_key),
        StageKind::Typename { title } => KindKey::Typename(title),
        StageKind::Branch { variant, .. } => KindKey::Branch(*variant),
    };
    content_hash(&StructuralKey {
        field,
        kind,
        children: child_hashes,
    })
}

struct PlanningContext<'d, 's> {
    schema: &'s SchemaIndex,
    max_depth: usize,
    operation_kind: OperationKind,
    effect_override: Option<EffectKind>,
    fragments: HashMap<&'d str, &'d Node<ast::FragmentDefinition>>,
    defined_variables: HashSet<&'d str>,
    variables: Object,
}

impl<'d, 's> PlanningContext<'d, 's> {
    fn coerce_variables(
        &self,
        definitions: &[Node<ast::VariableDefinition>],
        provided: &Object,
    ) -> Result<Object, PlanningError> {
        let mut variables = Object::new();
        for definition in definitions {
            let name = definition.name.as_str();
            match provided.get(name) {
                Some(value) => {
                    variables.insert(name, value.clone());
                }
                None => match &definition.default_value {
                    Some(default) => {
                        if let Some(value) = self.value_from_ast(default)? {
                            variables.insert(name, value);
                        }
                    }
                    None if definition.ty.is_non_null() => {
                        return Err(PlanningError::MissingVariable {
                            name: name.to_string(),
                        });
                    }
                    None => {}
                },
            }
        }
        Ok(variables)
    }

    /// Converts a literal to JSON. `None` stands for a variable that was not
    /// provided.
    fn value_from_ast(&self, value: &ast::Value) -> Result<Option<Value>, PlanningError> {
        Ok(Some(match value {
            ast::Value::Null => Value::Null,
            ast::Value::Enum(name) => Value::from(name.as_str()),
            ast::Value::Variable(name) => {
                if !self.defined_variables.contains(name.as_str()) {
                    return Err(PlanningError::UndefinedVariable {
                        name: name.to_string(),
                    });
                }
                return Ok(self.variables.get(name.as_str()).cloned());
            }
            ast::Value::String(s) => Value::from(s.as_str()),
            ast::Value::Float(f) => number(f.as_str()),
            ast::Value::Int(i) => number(i.as_str()),
            ast::Value::Boolean(b) => Value::Bool(*b),
            ast::Value::List(items) => Value::Array(
                items
                    .iter()
                    .map(|item| Ok(self.value_from_ast(item)?.unwrap_or(Value::Null)))
                    .collect::<Result<_, PlanningError>>()?,
            ),
            ast::Value::Object(fields) => {
                let mut object = Object::new();
                for (name, value) in fields {
                    if let Some(value) = self.value_from_ast(value)? {
                        object.insert(name.as_str(), value);
                    }
                }
                Value::Object(object)
            }
        }))
    }

    /// Evaluates `@skip` and `@include`.
    fn included(&self, directives: &ast::DirectiveList) -> Result<bool, PlanningError> {
        for directive in directives.iter() {
            let skip_when = match directive.name.as_str() {
                "skip" => true,
                "include" => false,
                _ => continue,
            };
            let condition = directive
                .arguments
                .iter()
                .find(|argument| argument.name.as_str() == "if")
                .map(|argument| self.value_from_ast(&argument.value))
                .transpose()?
                .flatten();
            if condition == Some(Value::Bool(skip_when)) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Whether a type condition applies to `object_type`.
    fn applies(&self, condition: &str, object_type: TypeIdx) -> Result<bool, PlanningError> {
        let condition = self
            .schema
            .type_by_name(condition)
            .ok_or_else(|| PlanningError::UnknownType {
                name: condition.to_string(),
            })?;
        Ok(condition == self.schema.canonical(object_type))
    }

    fn collect_fields(
        &self,
        object_type: TypeIdx,
        selections: &'d [ast::Selection],
        fields: &mut IndexMap<String, CollectedField<'d>>,
        visited: &mut Vec<&'d str>,
    ) -> Result<(), PlanningError> {
        for selection in selections {
            match selection {
                ast::Selection::Field(field) => {
                    if !self.included(&field.directives)? {
                        continue;
                    }
                    let response_key = field.alias.as_ref().unwrap_or(&field.name).to_string();
                    match fields.get_mut(&response_key) {
                        Some(existing) => {
                            if existing.name != field.name.as_str()
                                || existing.arguments != field.arguments.as_slice()
                            {
                                return Err(PlanningError::FieldConflict { response_key });
                            }
                            existing.selection_sets.push(field.selection_set.as_slice());
                        }
                        None => {
                            fields.insert(
                                response_key,
                                CollectedField {
                                    name: field.name.as_str(),
                                    alias: field.alias.as_ref().map(|alias| alias.as_str()),
                                    arguments: field.arguments.as_slice(),
                                    selection_sets: vec![field.selection_set.as_slice()],
                                },
                            );
                        }
                    }
                }
                ast::Selection::FragmentSpread(spread) => {
                    if !self.included(&spread.directives)? {
                        continue;
                    }
                    let name = spread.fragment_name.as_str();
                    let fragment =
                        self.fragments
                            .get(name)
                            .ok_or_else(|| PlanningError::UnknownFragment {
                                name: name.to_string(),
                            })?;
                    if visited.contains(&name)
                        || !self.applies(&fragment.type_condition, object_type)?
                    {
                        continue;
                    }
                    visited.push(name);
                    self.collect_fields(object_type, &fragment.selection_set, fields, visited)?;
                    visited.pop();
                }
                ast::Selection::InlineFragment(inline) => {
                    if !self.included(&inline.directives)? {
                        continue;
                    }
                    if let Some(condition) = &inline.type_condition {
                        if !self.applies(condition, object_type)? {
                            continue;
                        }
                    }
                    self.collect_fields(object_type, &inline.selection_set, fields, visited)?;
                }
            }
        }
        Ok(())
    }

    fn plan_object(
        &self,
        object_type: TypeIdx,
        selection_sets: &[&'d [ast::Selection]],
        depth: usize,
        effect: EffectKind,
    ) -> Result<Vec<PlannedNode>, PlanningError> {
        if depth > self.max_depth {
            return Err(PlanningError::MaxDepth {
                limit: self.max_depth,
            });
        }
        let mut fields = IndexMap::new();
        for selections in selection_sets {
            self.collect_fields(object_type, selections, &mut fields, &mut Vec::new())?;
        }

        let object = self.schema.resolve(object_type);
        let mut nodes = Vec::with_capacity(fields.len());
        for (response_key, field) in fields {
            if field.name == TYPENAME {
                let kind = StageKind::Typename {
                    title: object.title.clone(),
                };
                nodes.push(PlannedNode {
                    hash: structural_hash(TYPENAME, &kind, &[]),
                    response_key,
                    field_name: TYPENAME.to_string(),
                    kind,
                    type_idx: object_type,
                    effect,
                    policies: vec![],
                    check_policies: false,
                    children: vec![],
                });
                continue;
            }
            let property = self
                .schema
                .properties(object_type)
                .and_then(|properties| properties.get(field.name))
                .copied()
                .ok_or_else(|| PlanningError::UnknownField {
                    type_name: object.title.clone(),
                    field: field.name.to_string(),
                })?;
            nodes.push(self.plan_field(object_type, response_key, &field, property, depth, effect)?);
        }
        Ok(nodes)
    }

    fn plan_field(
        &self,
        object_type: TypeIdx,
        response_key: String,
        field: &CollectedField<'d>,
        property: TypeIdx,
        depth: usize,
        inherited_effect: EffectKind,
    ) -> Result<PlannedNode, PlanningError> {
        let (kind, type_idx, effect, policies, check_policies, children) =
            match self.schema.function(property) {
                Some(function) => {
                    let (materializer_idx, materializer) = self
                        .schema
                        .materializer_for(property)
                        .ok_or_else(|| PlanningError::UnknownField {
                            type_name: self.schema.resolve(object_type).title.clone(),
                            field: field.name.to_string(),
                        })?;
                    let effect = materializer.effect.kind();
                    self.check_effect(field.name, effect, depth)?;
                    let arguments = self.bind_arguments(object_type, field, function, effect)?;
                    let children =
                        self.plan_selection(field, function.output, depth, effect)?;
                    let selection = (self.schema.runtime_kind(materializer.runtime)
                        == RuntimeKind::GraphQL)
                        .then(|| render_selection(&children))
                        .flatten();
                    let kind = StageKind::Function {
                        function: self.schema.canonical(property),
                        materializer: materializer_idx,
                        runtime: materializer.runtime,
                        arguments,
                        rate_weight: function.rate_weight,
                        rate_calls: function.rate_calls,
                        selection,
                    };
                    let policies = self.schema.policies_for(property, effect);
                    (kind, function.output, effect, policies, true, children)
                }
                None => {
                    if let Some(argument) = field.arguments.first() {
                        return Err(PlanningError::UnknownArgument {
                            field: field.name.to_string(),
                            argument: argument.name.to_string(),
                        });
                    }
                    let children = self.plan_selection(field, property, depth, inherited_effect)?;
                    let kind = StageKind::Field {
                        source_key: self.schema.source_key(object_type, field.name).to_string(),
                    };
                    let policies = self.schema.policies_for(property, inherited_effect);
                    let check = !policies.is_empty();
                    (kind, property, inherited_effect, policies, check, children)
                }
            };

        Ok(PlannedNode {
            hash: structural_hash(field.name, &kind, &children),
            response_key,
            field_name: field.name.to_string(),
            kind,
            type_idx,
            effect,
            policies,
            check_policies,
            children,
        })
    }

    fn check_effect(&self, field: &str, effect: EffectKind, depth: usize) -> Result<(), PlanningError> {
        let mismatch = |operation: &str| PlanningError::EffectMismatch {
            field: field.to_string(),
            effect: effect.to_string(),
            operation: operation.to_string(),
        };
        if let Some(expected) = self.effect_override {
            if expected != effect {
                return Err(mismatch(&format!("{expected} request")));
            }
        }
        match self.operation_kind {
            OperationKind::Query if effect != EffectKind::Read => Err(mismatch("query")),
            OperationKind::Mutation if depth == 1 && effect == EffectKind::Read => {
                Err(mismatch("mutation"))
            }
            _ => Ok(()),
        }
    }

    /// Plans the sub-selection of a field of type `type_idx`.
    fn plan_selection(
        &self,
        field: &CollectedField<'d>,
        type_idx: TypeIdx,
        depth: usize,
        effect: EffectKind,
    ) -> Result<Vec<PlannedNode>, PlanningError> {
        let base = self.schema.base_type(type_idx);
        let node = self.schema.resolve(base);
        let has_selection = field.selection_sets.iter().any(|set| !set.is_empty());
        let missing_selection = || PlanningError::MissingSelectionSet {
            field: field.name.to_string(),
            type_name: node.title.clone(),
        };
        match &node.kind {
            TypeKind::Object { .. } => {
                if !has_selection {
                    return Err(missing_selection());
                }
                self.plan_object(base, &field.selection_sets, depth + 1, effect)
            }
            TypeKind::Union { .. } | TypeKind::Either { .. } => {
                let variants: Vec<TypeIdx> = self
                    .schema
                    .variants(base)
                    .unwrap_or_default()
                    .iter()
                    .map(|variant| self.schema.base_type(*variant))
                    .filter(|variant| self.schema.properties(*variant).is_some())
                    .collect();
                if !has_selection {
                    return if variants.is_empty() {
                        Ok(vec![])
                    } else {
                        Err(missing_selection())
                    };
                }
                let mut branches = Vec::with_capacity(variants.len());
                for variant in variants {
                    let children =
                        self.plan_object(variant, &field.selection_sets, depth + 1, effect)?;
                    let title = self.schema.resolve(variant).title.clone();
                    let kind = StageKind::Branch { variant, title };
                    branches.push(PlannedNode {
                        hash: structural_hash("", &kind, &children),
                        response_key: String::new(),
                        field_name: String::new(),
                        kind,
                        type_idx: variant,
                        effect,
                        policies: vec![],
                        check_policies: false,
                        children,
                    });
                }
                Ok(branches)
            }
            _ => {
                if has_selection {
                    return Err(PlanningError::UnexpectedSelectionSet {
                        field: field.name.to_string(),
                        type_name: node.title.clone(),
                    });
                }
                Ok(vec![])
            }
        }
    }

    /// Decides where every input field of a function gets its value.
    ///
    /// In order: a caller value, a reduced value, an injection, the default
    /// of an optional field. Optional fields without any of these are left
    /// out.
    fn bind_arguments(
        &self,
        object_type: TypeIdx,
        field: &CollectedField<'d>,
        function: &FunctionNode,
        effect: EffectKind,
    ) -> Result<IndexMap<String, ArgumentBinding>, PlanningError> {
        let properties = self
            .schema
            .properties(function.input)
            .cloned()
            .unwrap_or_default();

        let mut provided = HashMap::with_capacity(field.arguments.len());
        for argument in field.arguments {
            let name = argument.name.as_str();
            if !properties.contains_key(name) {
                return Err(PlanningError::UnknownArgument {
                    field: field.name.to_string(),
                    argument: name.to_string(),
                });
            }
            if let Some(value) = self.value_from_ast(&argument.value)? {
                provided.insert(name, value);
            }
        }

        let mut bindings = IndexMap::with_capacity(properties.len());
        for (name, type_idx) in &properties {
            let injection = function
                .injections
                .get(name)
                .filter(|injection| injection.applies_to(effect));
            let reduce = function.reduce.get(name);
            let optional = self.schema.is_optional(*type_idx);

            let binding = if let Some(value) = provided.remove(name.as_str()) {
                if injection.is_some() {
                    return Err(PlanningError::InjectedArgument {
                        field: field.name.to_string(),
                        argument: name.clone(),
                    });
                }
                if reduce.is_some_and(|reduce| !reduce.inherit) {
                    return Err(PlanningError::ReducedOverride {
                        field: field.name.to_string(),
                        argument: name.clone(),
                    });
                }
                ArgumentBinding::Value { value }
            } else if let Some(reduce) = reduce {
                ArgumentBinding::Value {
                    value: reduce.value.clone(),
                }
            } else if let Some(injection) = injection {
                self.injection_binding(object_type, injection, effect, *type_idx, optional)
            } else if let Some(default) = self.schema.default_value(*type_idx) {
                ArgumentBinding::Value {
                    value: default.clone(),
                }
            } else if optional {
                continue;
            } else {
                return Err(PlanningError::MissingArgument {
                    field: field.name.to_string(),
                    argument: name.clone(),
                });
            };
            bindings.insert(name.clone(), binding);
        }
        Ok(bindings)
    }

    fn injection_binding(
        &self,
        object_type: TypeIdx,
        injection: &Injection,
        effect: EffectKind,
        type_idx: TypeIdx,
        optional: bool,
    ) -> ArgumentBinding {
        // `applies_to` was checked by the caller, so the lookups below succeed
        let data = |value: Option<&String>| value.cloned().unwrap_or_default();
        match injection {
            Injection::Static(value) => ArgumentBinding::Value {
                value: value.for_effect(effect).cloned().unwrap_or(Value::Null),
            },
            Injection::Context(path) => ArgumentBinding::Context {
                path: data(path.for_effect(effect)),
                optional,
            },
            Injection::Secret(name) => ArgumentBinding::Secret {
                name: data(name.for_effect(effect)),
            },
            Injection::Parent(key) => {
                let key = data(key.for_effect(effect));
                let computed = self
                    .schema
                    .properties(object_type)
                    .and_then(|properties| properties.get(&key))
                    .is_some_and(|property| self.schema.function(*property).is_some());
                if computed {
                    ArgumentBinding::Sibling {
                        field: key,
                        stage: StageId::root(),
                        optional,
                    }
                } else {
                    ArgumentBinding::Parent {
                        key: self.schema.source_key(object_type, &key).to_string(),
                        optional,
                    }
                }
            }
            Injection::Random => ArgumentBinding::Random { type_idx },
            Injection::Now => ArgumentBinding::Now,
        }
    }
}

fn number(literal: &str) -> Value {
    if let Ok(int) = literal.parse::<i64>() {
        return Value::from(int);
    }
    literal
        .parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

/// Renders the plain fields of a selection as GraphQL, for runtimes that
/// forward the sub-selection to a remote server.
fn render_selection(nodes: &[PlannedNode]) -> Option<String> {
    let parts: Vec<String> = nodes
        .iter()
        .filter_map(|node| match &node.kind {
            StageKind::Field { source_key } => Some(match render_selection(&node.children) {
                Some(selection) => format!("{source_key} {selection}"),
                None => source_key.clone(),
            }),
            StageKind::Typename { .. } => Some(TYPENAME.to_string()),
            StageKind::Branch { title, .. } => Some(format!(
                "... on {title} {}",
                render_selection(&node.children).unwrap_or_else(|| format!("{{ {TYPENAME} }}"))
            )),
            StageKind::Function { .. } => None,
        })
        .collect();
    (!parts.is_empty()).then(|| format!("{{ {} }}", parts.join(" ")))
}

fn unique_stages(shape: &[ShapeNode]) -> Vec<StageId> {
    let mut ids: Vec<StageId> = Vec::with_capacity(shape.len());
    for node in shape {
        if !ids.contains(&node.stage) {
            ids.push(node.stage.clone());
        }
    }
    ids
}

/// Allocates stage ids and records the response shape.
#[derive(Default)]
struct Allocator {
    stages: IndexMap<StageId, Stage>,
    /// Stage of every structural hash, per parent stage.
    seen: HashMap<(StageId, String), StageId>,
    segments: HashMap<StageId, HashSet<String>>,
}

impl Allocator {
    fn allocate_id(&mut self, parent: &StageId, node: &PlannedNode) -> StageId {
        let used = self.segments.entry(parent.clone()).or_default();
        let preferred = node.segment();
        let mut segment = preferred.clone();
        if used.contains(&segment) {
            segment = format!("{preferred}@{}", node.response_key);
        }
        let mut suffix = 1;
        while used.contains(&segment) {
            suffix += 1;
            segment = format!("{preferred}@{}{suffix}", node.response_key);
        }
        used.insert(segment.clone());
        get_child_id(parent, &segment)
    }

    fn place_group(
        &mut self,
        parent: &StageId,
        nodes: Vec<PlannedNode>,
    ) -> Result<Vec<ShapeNode>, PlanningError> {
        let mut placed = Vec::with_capacity(nodes.len());
        for node in nodes {
            let key = (parent.clone(), node.hash.clone());
            match self.seen.get(&key) {
                Some(id) => placed.push((id.clone(), false, node)),
                None => {
                    let id = self.allocate_id(parent, &node);
                    self.seen.insert(key, id.clone());
                    placed.push((id, true, node));
                }
            }
        }

        let mut function_ids: HashMap<&str, &StageId> = HashMap::new();
        for (id, _, node) in &placed {
            if matches!(node.kind, StageKind::Function { .. }) {
                function_ids.entry(node.field_name.as_str()).or_insert(id);
            }
        }

        let mut new_stages = Vec::new();
        for (id, is_new, node) in &placed {
            if !*is_new {
                continue;
            }
            let mut kind = node.kind.clone();
            let mut depends_on = Vec::new();
            if let StageKind::Function { arguments, .. } = &mut kind {
                for (argument, binding) in arguments.iter_mut() {
                    if let ArgumentBinding::Sibling { field, stage, .. } = binding {
                        let sibling = function_ids.get(field.as_str()).ok_or_else(|| {
                            PlanningError::MissingDependency {
                                field: node.field_name.clone(),
                                argument: argument.clone(),
                                dependency: field.clone(),
                            }
                        })?;
                        *stage = (*sibling).clone();
                        if !depends_on.contains(*sibling) {
                            depends_on.push((*sibling).clone());
                        }
                    }
                }
            }
            new_stages.push(id.clone());
            self.stages.insert(
                id.clone(),
                Stage {
                    id: id.clone(),
                    parent: parent.clone(),
                    field_name: node.field_name.clone(),
                    kind,
                    type_idx: node.type_idx,
                    effect: node.effect,
                    policies: node.policies.clone(),
                    check_policies: node.check_policies,
                    children: vec![],
                    depends_on,
                },
            );
        }
        self.check_cycles(&new_stages)?;

        let mut shape = Vec::with_capacity(placed.len());
        for (id, is_new, node) in placed {
            let children = self.place_group(&id, node.children)?;
            if is_new {
                let child_ids = unique_stages(&children);
                if let Some(stage) = self.stages.get_mut(&id) {
                    stage.children = child_ids;
                }
            }
            shape.push(ShapeNode {
                response_key: (!node.response_key.is_empty()).then_some(node.response_key),
                stage: id,
                children,
            });
        }
        Ok(shape)
    }

    fn check_cycles(&self, group: &[StageId]) -> Result<(), PlanningError> {
        fn visit(
            stages: &IndexMap<StageId, Stage>,
            id: &StageId,
            path: &mut Vec<StageId>,
            done: &mut HashSet<StageId>,
        ) -> Result<(), PlanningError> {
            if done.contains(id) {
                return Ok(());
            }
            if path.contains(id) {
                return Err(PlanningError::DependencyCycle {
                    field: id.to_string(),
                });
            }
            path.push(id.clone());
            if let Some(stage) = stages.get(id) {
                for dependency in &stage.depends_on {
                    visit(stages, dependency, path, done)?;
                }
            }
            path.pop();
            done.insert(id.clone());
            Ok(())
        }

        let mut done = HashSet::new();
        for id in group {
            visit(&self.stages, id, &mut Vec::new(), &mut done)?;
        }
        Ok(())
    }
}
