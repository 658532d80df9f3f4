//! Builds query plans from normalized operations and data source configurations.

use std::sync::Arc;

use indexmap::IndexSet;
use tracing::instrument;

use super::FlattenNode;
use super::OperationKind;
use super::PlanNode;
use super::QueryPlan;
use super::fetch::FetchKind;
use super::fetch::FetchNode;
use super::fetch::ParentArgument;
use super::selection;
use crate::ast;
use crate::ast::Document;
use crate::ast::OperationDefinition;
use crate::ast::Position;
use crate::ast::SelectionSetRef;
use crate::ast::TypeRef;
use crate::ast::ValueRef;
use crate::configuration::DataSourceConfiguration;
use crate::configuration::FieldConfiguration;
use crate::configuration::FieldConfigurations;
use crate::error::PlanningError;
use crate::error::PlanningErrors;
use crate::json_ext::Path;
use crate::json_ext::PathElement;
use crate::json_ext::Value;
use crate::sources::PlanningBehavior;
use crate::spec::FieldType;
use crate::spec::Query;
use crate::spec::Schema;
use crate::spec::TYPENAME;

const REPRESENTATIONS: &str = "representations";
const ENTITIES: &str = "_entities";
const ANY_SCALAR: &str = "_Any";

/// Plans operations against a fixed set of data sources.
///
/// Data sources are considered in declaration order: when several of them can resolve a field,
/// the first one wins.
#[derive(Debug, Clone)]
pub struct Planner {
    schema: Arc<Schema>,
    data_sources: Vec<DataSourceConfiguration>,
    behaviors: Vec<PlanningBehavior>,
    field_configurations: FieldConfigurations,
}

impl Planner {
    pub fn new(
        schema: Arc<Schema>,
        data_sources: Vec<DataSourceConfiguration>,
        field_configurations: FieldConfigurations,
    ) -> Self {
        let behaviors = data_sources
            .iter()
            .map(|data_source| data_source.kind.planning_behavior())
            .collect();
        Self {
            schema,
            data_sources,
            behaviors,
            field_configurations,
        }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Plans the operation named `operation_name` of a normalized document.
    #[instrument(skip_all, level = "debug", name = "plan")]
    pub fn plan(
        &self,
        document: &Document,
        operation_name: Option<&str>,
    ) -> Result<QueryPlan, PlanningErrors> {
        let operation_ref = document.operation_by_name(operation_name).ok_or_else(|| {
            PlanningErrors::new(vec![PlanningError::UnknownOperation {
                name: operation_name.unwrap_or_default().to_string(),
            }])
        })?;
        let operation = document.operation(operation_ref);
        let root_type = self
            .schema
            .root_type_name(operation.kind)
            .ok_or_else(|| {
                PlanningErrors::new(vec![PlanningError::MissingRootType {
                    kind: operation.kind.to_string(),
                }])
            })?
            .to_string();

        let mut builder = PlanBuilder {
            planner: self,
            document,
            operation,
            fetches: Vec::new(),
            root_fetches: Vec::new(),
            errors: Vec::new(),
        };
        let selections = lower(document, operation.selection_set, true, &mut builder.errors);
        builder.root(&root_type, &selections);
        if !builder.errors.is_empty() {
            return Err(PlanningErrors::new(builder.errors));
        }

        let root = builder.arrange();

        let query = Query::from_operation(document, operation_ref, &self.schema)
            .map_err(|error| PlanningErrors::new(vec![error]))?;

        Ok(QueryPlan {
            root,
            query: Arc::new(query),
        })
    }
}

/// A selection as it will be sent upstream.
#[derive(Debug, Clone, PartialEq)]
enum Sel {
    Field(SelField),
    InlineFragment {
        type_condition: Option<String>,
        selections: Vec<Sel>,
    },
}

#[derive(Debug, Clone, PartialEq)]
struct SelField {
    alias: Option<String>,
    name: String,
    arguments: Vec<(String, ArgValue)>,
    selections: Option<Vec<Sel>>,
}

#[derive(Debug, Clone, PartialEq)]
enum ArgValue {
    /// A value of the planned operation.
    Operation(ValueRef),
    /// A variable bound by the planner.
    Variable(String),
    Constant(Value),
}

impl SelField {
    fn leaf(name: &str) -> Self {
        Self {
            alias: None,
            name: name.to_string(),
            arguments: Vec::new(),
            selections: None,
        }
    }

    fn response_key(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

impl Sel {
    fn typename() -> Self {
        Sel::Field(SelField::leaf(TYPENAME))
    }

    /// Appends the representation requirement of this selection to `requires`. A fragment
    /// without a type condition contributes its children directly.
    fn to_requires(&self, requires: &mut Vec<selection::Selection>) {
        match self {
            Sel::Field(field) => requires.push(selection::Selection::Field {
                name: field.name.clone(),
                response_key: field.alias.clone(),
                children: Sel::requires_of(field.selections.iter().flatten()),
            }),
            Sel::InlineFragment {
                type_condition: Some(type_name),
                selections,
            } => requires.push(selection::Selection::OnType {
                type_name: type_name.clone(),
                children: Sel::requires_of(selections),
            }),
            Sel::InlineFragment {
                type_condition: None,
                selections,
            } => selections
                .iter()
                .for_each(|selection| selection.to_requires(requires)),
        }
    }

    fn requires_of<'a>(selections: impl IntoIterator<Item = &'a Sel>) -> Vec<selection::Selection> {
        let mut requires = Vec::new();
        for selection in selections {
            selection.to_requires(&mut requires);
        }
        requires
    }
}

/// Adds a selection, merging it with a selection of the same response key or type condition.
fn merge_selection(out: &mut Vec<Sel>, selection: Sel) {
    match selection {
        Sel::Field(field) => {
            let existing = out.iter_mut().find_map(|candidate| match candidate {
                Sel::Field(existing) if existing.response_key() == field.response_key() => {
                    Some(existing)
                }
                _ => None,
            });
            match existing {
                Some(existing) => {
                    if let (Some(into), Some(children)) =
                        (existing.selections.as_mut(), field.selections)
                    {
                        for child in children {
                            merge_selection(into, child);
                        }
                    }
                }
                None => out.push(Sel::Field(field)),
            }
        }
        Sel::InlineFragment {
            type_condition,
            selections,
        } => {
            let existing = out.iter_mut().find_map(|candidate| match candidate {
                Sel::InlineFragment {
                    type_condition: existing,
                    selections: into,
                } if *existing == type_condition => Some(into),
                _ => None,
            });
            match existing {
                Some(into) => {
                    for child in selections {
                        merge_selection(into, child);
                    }
                }
                None => out.push(Sel::InlineFragment {
                    type_condition,
                    selections,
                }),
            }
        }
    }
}

fn lower(
    document: &Document,
    selection_set: SelectionSetRef,
    with_arguments: bool,
    errors: &mut Vec<PlanningError>,
) -> Vec<Sel> {
    let mut selections = Vec::new();
    for selection in &document.selection_set(selection_set).selections {
        match selection {
            ast::Selection::Field(r) => {
                let field = document.field(*r);
                let arguments = if with_arguments {
                    field
                        .arguments
                        .iter()
                        .map(|argument| (argument.name.clone(), ArgValue::Operation(argument.value)))
                        .collect()
                } else {
                    Vec::new()
                };
                let children = field
                    .selection_set
                    .map(|set| lower(document, set, with_arguments, errors));
                selections.push(Sel::Field(SelField {
                    alias: field.alias.clone(),
                    name: field.name.clone(),
                    arguments,
                    selections: children,
                }));
            }
            ast::Selection::InlineFragment(r) => {
                let fragment = document.inline_fragment(*r);
                selections.push(Sel::InlineFragment {
                    type_condition: fragment.type_condition.clone(),
                    selections: lower(document, fragment.selection_set, with_arguments, errors),
                });
            }
            ast::Selection::FragmentSpread(r) => {
                errors.push(PlanningError::UnnormalizedFragmentSpread {
                    name: document.fragment_spread(*r).name.clone(),
                });
            }
        }
    }
    selections
}

fn list_depth(field_type: &FieldType) -> usize {
    match field_type {
        FieldType::List(inner) => 1 + list_depth(inner),
        FieldType::NonNull(inner) => list_depth(inner),
        _ => 0,
    }
}

#[derive(Debug, Default)]
struct PlannedFetch {
    source: usize,
    kind: FetchKind,
    parent: Option<usize>,
    /// Sibling fetches that must complete first.
    depends_on: Vec<usize>,
    path: Path,
    type_name: String,
    selections: Vec<Sel>,
    /// Fields of entity representations.
    representation: Vec<Sel>,
    parent_arguments: Vec<ParentArgument>,
    /// Types of planner bound variables, in the schema document.
    variable_types: Vec<(String, TypeRef)>,
    response_key: Option<String>,
}

struct PlanBuilder<'a> {
    planner: &'a Planner,
    document: &'a Document,
    operation: &'a OperationDefinition,
    fetches: Vec<PlannedFetch>,
    root_fetches: Vec<usize>,
    errors: Vec<PlanningError>,
}

impl PlanBuilder<'_> {
    fn add_fetch(&mut self, fetch: PlannedFetch) -> usize {
        self.fetches.push(fetch);
        self.fetches.len() - 1
    }

    fn root(&mut self, root_type: &str, selections: &[Sel]) {
        let planner = self.planner;
        let mut fields = Vec::new();
        self.root_fields(root_type, selections, &mut fields);

        for field in fields {
            if field.name == TYPENAME {
                continue;
            }
            let owner = match planner
                .data_sources
                .iter()
                .position(|data_source| data_source.has_root_node(root_type, &field.name))
            {
                Some(owner) => owner,
                None => {
                    self.errors.push(PlanningError::MissingRootDataSource {
                        type_name: root_type.to_string(),
                        field_name: field.name.clone(),
                    });
                    continue;
                }
            };

            // mutation fields only share a fetch with adjacent fields to keep their order
            let existing = match self.operation.kind {
                OperationKind::Mutation => self
                    .root_fetches
                    .last()
                    .copied()
                    .filter(|last| self.fetches[*last].source == owner),
                _ => self
                    .root_fetches
                    .iter()
                    .copied()
                    .find(|index| self.fetches[*index].source == owner),
            };
            let fetch = match existing {
                Some(fetch) => fetch,
                None => {
                    let fetch = self.add_fetch(PlannedFetch {
                        source: owner,
                        type_name: root_type.to_string(),
                        ..Default::default()
                    });
                    self.root_fetches.push(fetch);
                    fetch
                }
            };

            if let Some(selection) = self.field(fetch, root_type, field, &Path::empty()) {
                merge_selection(&mut self.fetches[fetch].selections, selection);
            }
        }
    }

    /// Root fields, with the inline fragments of the root type flattened.
    fn root_fields<'s>(&mut self, root_type: &str, selections: &'s [Sel], out: &mut Vec<&'s SelField>) {
        for selection in selections {
            match selection {
                Sel::Field(field) => out.push(field),
                Sel::InlineFragment {
                    type_condition,
                    selections,
                } => {
                    let condition = type_condition.as_deref().unwrap_or(root_type);
                    if self.planner.schema.types_overlap(root_type, condition) {
                        self.root_fields(root_type, selections, out);
                    } else {
                        self.errors.push(PlanningError::IncompatibleFragment {
                            type_condition: condition.to_string(),
                            parent_type: root_type.to_string(),
                        });
                    }
                }
            }
        }
    }

    /// Plans one field resolved by `fetch`, returning its upstream selection.
    fn field(&mut self, fetch: usize, parent_type: &str, field: &SelField, path: &Path) -> Option<Sel> {
        let planner = self.planner;
        let field_type = match planner.schema.field_type(parent_type, &field.name) {
            Some(field_type) => field_type,
            None => {
                self.errors.push(PlanningError::UnknownField {
                    type_name: parent_type.to_string(),
                    field_name: field.name.clone(),
                });
                return None;
            }
        };

        let key = field.response_key().to_string();
        let configuration = planner.field_configurations.get(parent_type, &field.name);
        let name = configuration
            .and_then(FieldConfiguration::upstream_name)
            .unwrap_or(&field.name)
            .to_string();
        let alias = (name != key).then(|| key.clone());

        let mut arguments = field.arguments.clone();
        if let Some(configuration) = configuration {
            for (argument, value) in configuration.constant_arguments() {
                if !arguments.iter().any(|(name, _)| name == argument) {
                    arguments.push((argument.to_string(), ArgValue::Constant(value.clone())));
                }
            }
        }

        let selections = match &field.selections {
            None => None,
            Some(children) => {
                let mut child_path = path.clone();
                child_path.push(PathElement::Key(key));
                for _ in 0..list_depth(&field_type) {
                    child_path.push(PathElement::Flatten);
                }
                let type_name = field_type.inner_type_name().to_string();

                let mut out = Vec::new();
                if planner.schema.is_abstract(&type_name)
                    && planner.behaviors[self.fetches[fetch].source].typename_for_abstract
                {
                    merge_selection(&mut out, Sel::typename());
                }
                self.selection_set(fetch, &type_name, children, &child_path, &mut out);
                if out.is_empty() {
                    out.push(Sel::typename());
                }
                Some(out)
            }
        };

        Some(Sel::Field(SelField {
            alias,
            name,
            arguments,
            selections,
        }))
    }

    fn selection_set(
        &mut self,
        fetch: usize,
        parent_type: &str,
        selections: &[Sel],
        path: &Path,
        out: &mut Vec<Sel>,
    ) {
        let planner = self.planner;
        for selection in selections {
            match selection {
                Sel::Field(field) if field.name == TYPENAME => {
                    merge_selection(out, selection.clone());
                }
                Sel::Field(field) => {
                    let source = &planner.data_sources[self.fetches[fetch].source];
                    if source.resolves(parent_type, &field.name)
                        || self.stays_with_parent(parent_type, &field.name)
                    {
                        if let Some(selection) = self.field(fetch, parent_type, field, path) {
                            merge_selection(out, selection);
                        }
                    } else {
                        self.boundary(fetch, parent_type, field, path, out);
                    }
                }
                Sel::InlineFragment {
                    type_condition,
                    selections,
                } => {
                    let condition = type_condition.as_deref().unwrap_or(parent_type);
                    if !planner.schema.types_overlap(parent_type, condition) {
                        self.errors.push(PlanningError::IncompatibleFragment {
                            type_condition: condition.to_string(),
                            parent_type: parent_type.to_string(),
                        });
                        continue;
                    }
                    let mut inner = Vec::new();
                    self.selection_set(fetch, condition, selections, path, &mut inner);
                    if !inner.is_empty() {
                        merge_selection(
                            out,
                            Sel::InlineFragment {
                                type_condition: type_condition.clone(),
                                selections: inner,
                            },
                        );
                    }
                }
            }
        }
    }

    /// Fields a fetch resolves without its source declaring them: fields of an interface or
    /// union no source declares as a root node, and union typed fields of object types.
    fn stays_with_parent(&self, parent_type: &str, field_name: &str) -> bool {
        let planner = self.planner;
        if planner.schema.is_abstract(parent_type) {
            return !planner
                .data_sources
                .iter()
                .any(|data_source| data_source.has_root_node(parent_type, field_name));
        }
        planner
            .schema
            .field_type(parent_type, field_name)
            .is_some_and(|field_type| planner.schema.is_union(field_type.inner_type_name()))
    }

    /// Plans a field the source of `fetch` cannot resolve.
    ///
    /// Returns the fetch that resolves it.
    fn boundary(
        &mut self,
        fetch: usize,
        parent_type: &str,
        field: &SelField,
        path: &Path,
        out: &mut Vec<Sel>,
    ) -> Option<usize> {
        let planner = self.planner;
        let current = self.fetches[fetch].source;
        let candidates = || {
            planner
                .data_sources
                .iter()
                .enumerate()
                .filter(move |(index, _)| *index != current)
        };
        let owner = candidates()
            .find(|(_, data_source)| data_source.has_root_node(parent_type, &field.name))
            .or_else(|| {
                candidates()
                    .find(|(_, data_source)| data_source.has_child_node(parent_type, &field.name))
            })
            .map(|(index, _)| index);

        let owner = match owner {
            Some(owner) => owner,
            None => {
                self.errors.push(PlanningError::MissingDataSource {
                    type_name: parent_type.to_string(),
                    field_name: field.name.clone(),
                });
                return None;
            }
        };
        let data_source = &planner.data_sources[owner];

        if planner.behaviors[owner].entities {
            if let Some(key) = data_source.key(parent_type) {
                return self.entity_boundary(
                    fetch,
                    owner,
                    parent_type,
                    field,
                    path,
                    out,
                    &key.selection_set,
                );
            }
        }

        if let Some(configuration) = planner.field_configurations.get(parent_type, &field.name) {
            if configuration.parent_arguments().next().is_some()
                && data_source.has_root_node(parent_type, &field.name)
            {
                return self.nested_boundary(fetch, owner, parent_type, field, path, out, configuration);
            }
        }

        self.errors.push(PlanningError::MissingFederationKey {
            source_id: data_source.id.clone(),
            type_name: parent_type.to_string(),
        });
        None
    }

    #[allow(clippy::too_many_arguments)]
    fn entity_boundary(
        &mut self,
        fetch: usize,
        owner: usize,
        parent_type: &str,
        field: &SelField,
        path: &Path,
        out: &mut Vec<Sel>,
        key: &str,
    ) -> Option<usize> {
        let planner = self.planner;
        let keys = match self.parse_selection_set(parent_type, key) {
            Ok(keys) => keys,
            Err(error) => {
                self.errors.push(error);
                return None;
            }
        };

        let sibling = self.fetches.iter().position(|candidate| {
            candidate.parent == Some(fetch)
                && candidate.source == owner
                && candidate.path == *path
                && candidate.type_name == parent_type
                && matches!(candidate.kind, FetchKind::Entity | FetchKind::BatchEntity)
        });
        let entity = match sibling {
            Some(entity) => entity,
            None => {
                let kind = if path.iter().any(|element| matches!(element, PathElement::Flatten)) {
                    FetchKind::BatchEntity
                } else {
                    FetchKind::Entity
                };
                let mut representation = vec![Sel::typename()];
                for key in &keys {
                    merge_selection(&mut representation, key.clone());
                }
                self.add_fetch(PlannedFetch {
                    source: owner,
                    kind,
                    parent: Some(fetch),
                    path: path.clone(),
                    type_name: parent_type.to_string(),
                    representation,
                    ..Default::default()
                })
            }
        };

        merge_selection(out, Sel::typename());
        for key in keys {
            merge_selection(out, key);
        }

        if let Some(requires) = planner.data_sources[owner].requires(parent_type, &field.name) {
            match self.parse_selection_set(parent_type, &requires.selection_set) {
                Ok(required) => {
                    let current = &planner.data_sources[self.fetches[fetch].source];
                    for selection in required {
                        merge_selection(&mut self.fetches[entity].representation, selection.clone());
                        match &selection {
                            Sel::Field(required_field)
                                if required_field.name != TYPENAME
                                    && !current.resolves(parent_type, &required_field.name) =>
                            {
                                // the required field lives in a third source, fetched first
                                if let Some(dependency) =
                                    self.boundary(fetch, parent_type, required_field, path, out)
                                {
                                    let depends_on = &mut self.fetches[entity].depends_on;
                                    if dependency != entity && !depends_on.contains(&dependency) {
                                        depends_on.push(dependency);
                                    }
                                }
                            }
                            _ => merge_selection(out, selection),
                        }
                    }
                }
                Err(error) => self.errors.push(error),
            }
        }

        if let Some(selection) = self.field(entity, parent_type, field, path) {
            merge_selection(&mut self.fetches[entity].selections, selection);
        }
        Some(entity)
    }

    #[allow(clippy::too_many_arguments)]
    fn nested_boundary(
        &mut self,
        fetch: usize,
        owner: usize,
        parent_type: &str,
        field: &SelField,
        path: &Path,
        out: &mut Vec<Sel>,
        configuration: &FieldConfiguration,
    ) -> Option<usize> {
        let planner = self.planner;
        for required in &configuration.requires_fields {
            merge_selection(out, Sel::Field(SelField::leaf(required)));
        }

        let definition = planner.schema.field_definition(parent_type, &field.name);
        let mut nested_field = field.clone();
        let mut parent_arguments = Vec::new();
        let mut variable_types = Vec::new();
        for (name, argument_path) in configuration.parent_arguments() {
            let argument = definition
                .and_then(|definition| definition.arguments.iter().find(|a| a.name == name));
            match argument {
                Some(argument) => variable_types.push((name.to_string(), argument.ty)),
                None => {
                    self.errors.push(PlanningError::UnknownArgument {
                        type_name: parent_type.to_string(),
                        field_name: field.name.clone(),
                        argument: name.to_string(),
                    });
                    return None;
                }
            }
            parent_arguments.push(ParentArgument {
                name: name.to_string(),
                path: argument_path.to_vec(),
            });
            nested_field.arguments.retain(|(argument, _)| argument != name);
            nested_field
                .arguments
                .push((name.to_string(), ArgValue::Variable(name.to_string())));
        }

        let nested = self.add_fetch(PlannedFetch {
            source: owner,
            kind: FetchKind::Nested,
            parent: Some(fetch),
            path: path.clone(),
            type_name: parent_type.to_string(),
            parent_arguments,
            variable_types,
            response_key: Some(field.response_key().to_string()),
            ..Default::default()
        });
        if let Some(selection) = self.field(nested, parent_type, &nested_field, path) {
            merge_selection(&mut self.fetches[nested].selections, selection);
        }
        Some(nested)
    }

    /// Parses a `@key` or `@requires` selection set such as `"upc sku"`.
    fn parse_selection_set(&self, type_name: &str, text: &str) -> Result<Vec<Sel>, PlanningError> {
        let invalid = |reason: String| PlanningError::InvalidSelectionSet {
            type_name: type_name.to_string(),
            selection_set: text.to_string(),
            reason,
        };

        let document = ast::parse_executable(&format!("{{{text}}}"))
            .map_err(|errors| invalid(errors.to_string()))?;
        let operation = document
            .operation_by_name(None)
            .ok_or_else(|| invalid("expected a single selection set".to_string()))?;
        let mut errors = Vec::new();
        let selections = lower(
            &document,
            document.operation(operation).selection_set,
            false,
            &mut errors,
        );
        if let Some(error) = errors.into_iter().next() {
            return Err(invalid(error.to_string()));
        }
        self.check_fields(type_name, &selections).map_err(invalid)?;
        Ok(selections)
    }

    fn check_fields(&self, type_name: &str, selections: &[Sel]) -> Result<(), String> {
        for selection in selections {
            match selection {
                Sel::Field(field) => {
                    let field_type = self
                        .planner
                        .schema
                        .field_type(type_name, &field.name)
                        .ok_or_else(|| format!("unknown field '{}'", field.name))?;
                    if let Some(children) = &field.selections {
                        self.check_fields(field_type.inner_type_name(), children)?;
                    }
                }
                Sel::InlineFragment {
                    type_condition,
                    selections,
                } => {
                    self.check_fields(type_condition.as_deref().unwrap_or(type_name), selections)?;
                }
            }
        }
        Ok(())
    }

    fn arrange(&self) -> PlanNode {
        let nodes: Vec<FetchNode> = (0..self.fetches.len()).map(|index| self.emit(index)).collect();
        let mut children = vec![Vec::new(); self.fetches.len()];
        for (index, fetch) in self.fetches.iter().enumerate() {
            if let Some(parent) = fetch.parent {
                children[parent].push(index);
            }
        }

        let mut roots: Vec<PlanNode> = self
            .root_fetches
            .iter()
            .map(|index| self.subtree(*index, &nodes, &children))
            .collect();

        if roots.len() == 1 {
            return roots.remove(0);
        }
        match self.operation.kind {
            OperationKind::Query | OperationKind::Subscription if !roots.is_empty() => {
                PlanNode::Parallel { nodes: roots }
            }
            _ => PlanNode::Sequence { nodes: roots },
        }
    }

    /// A fetch runs before its children. Children are layered by their dependencies.
    fn subtree(&self, index: usize, nodes: &[FetchNode], children: &[Vec<usize>]) -> PlanNode {
        let fetch = PlanNode::Fetch(nodes[index].clone());
        let node = if self.fetches[index].parent.is_some() {
            PlanNode::Flatten(FlattenNode {
                path: self.fetches[index].path.clone(),
                node: Box::new(fetch),
            })
        } else {
            fetch
        };
        if children[index].is_empty() {
            return node;
        }

        let mut sequence = vec![node];
        for layer in self.layers(&children[index]) {
            let mut layer_nodes: Vec<PlanNode> = layer
                .iter()
                .map(|child| self.subtree(*child, nodes, children))
                .collect();
            if layer_nodes.len() == 1 {
                match layer_nodes.remove(0) {
                    PlanNode::Sequence { nodes } => sequence.extend(nodes),
                    node => sequence.push(node),
                }
            } else {
                sequence.push(PlanNode::Parallel { nodes: layer_nodes });
            }
        }
        PlanNode::Sequence { nodes: sequence }
    }

    fn layers(&self, siblings: &[usize]) -> Vec<Vec<usize>> {
        let mut levels = vec![0usize; siblings.len()];
        for _ in 0..siblings.len() {
            let mut changed = false;
            for (i, sibling) in siblings.iter().enumerate() {
                for dependency in &self.fetches[*sibling].depends_on {
                    if let Some(j) = siblings.iter().position(|s| s == dependency) {
                        if levels[i] < levels[j] + 1 {
                            levels[i] = levels[j] + 1;
                            changed = true;
                        }
                    }
                }
            }
            if !changed {
                break;
            }
        }

        let depth = levels.iter().copied().max().unwrap_or_default();
        (0..=depth)
            .map(|level| {
                siblings
                    .iter()
                    .zip(levels.iter())
                    .filter(|(_, l)| **l == level)
                    .map(|(sibling, _)| *sibling)
                    .collect::<Vec<_>>()
            })
            .filter(|layer| !layer.is_empty())
            .collect()
    }

    /// Prints the upstream operation of a planned fetch.
    fn emit(&self, index: usize) -> FetchNode {
        let planner = self.planner;
        let source = self.document;
        let planned = &self.fetches[index];

        let mut document = Document::default();
        let mut used = IndexSet::new();
        let selections: Vec<ast::Selection> = planned
            .selections
            .iter()
            .map(|selection| emit_selection(&mut document, source, selection, &mut used))
            .collect();

        let mut variable_definitions = Vec::new();
        let selection_set = match planned.kind {
            FetchKind::Entity | FetchKind::BatchEntity => {
                let any = document.add_named_type(ANY_SCALAR);
                let any = document.add_type(ast::Type::NonNull(any));
                let list = document.add_type(ast::Type::List(any));
                let ty = document.add_type(ast::Type::NonNull(list));
                variable_definitions.push(document.add_variable_definition(
                    ast::VariableDefinition {
                        name: REPRESENTATIONS.to_string(),
                        ty,
                        default_value: None,
                        directives: Vec::new(),
                    },
                ));

                let inner = document.add_selection_set(ast::SelectionSet { selections });
                let fragment = document.add_inline_fragment(ast::InlineFragment {
                    type_condition: Some(planned.type_name.clone()),
                    directives: Vec::new(),
                    selection_set: inner,
                    position: Position::default(),
                });
                let entities_set = document.add_selection_set(ast::SelectionSet {
                    selections: vec![ast::Selection::InlineFragment(fragment)],
                });
                let representations =
                    document.add_value(ast::Value::Variable(REPRESENTATIONS.to_string()));
                let entities = document.add_field(ast::Field {
                    alias: None,
                    name: ENTITIES.to_string(),
                    arguments: vec![ast::Argument {
                        name: REPRESENTATIONS.to_string(),
                        value: representations,
                    }],
                    directives: Vec::new(),
                    selection_set: Some(entities_set),
                    position: Position::default(),
                });
                document.add_selection_set(ast::SelectionSet {
                    selections: vec![ast::Selection::Field(entities)],
                })
            }
            _ => document.add_selection_set(ast::SelectionSet { selections }),
        };

        let mut variable_usages = Vec::new();
        for name in used {
            if let Some((_, ty)) = planned.variable_types.iter().find(|(n, _)| *n == name) {
                let ty = document.import_type(planner.schema.document(), *ty);
                variable_definitions.push(document.add_variable_definition(
                    ast::VariableDefinition {
                        name,
                        ty,
                        default_value: None,
                        directives: Vec::new(),
                    },
                ));
                continue;
            }
            let definition = self
                .operation
                .variable_definitions
                .iter()
                .map(|r| source.variable_definition(*r))
                .find(|definition| definition.name == name);
            if let Some(definition) = definition {
                let ty = document.import_type(source, definition.ty);
                let default_value = definition
                    .default_value
                    .map(|value| document.import_value(source, value));
                variable_definitions.push(document.add_variable_definition(
                    ast::VariableDefinition {
                        name: name.clone(),
                        ty,
                        default_value,
                        directives: Vec::new(),
                    },
                ));
                variable_usages.push(name);
            }
        }

        // fetches below the root always read
        let operation_kind = match planned.parent {
            None => self.operation.kind,
            Some(_) => OperationKind::Query,
        };
        let operation = document.add_operation(OperationDefinition {
            kind: operation_kind,
            name: None,
            variable_definitions,
            directives: Vec::new(),
            selection_set,
            position: Position::default(),
        });

        let requires = if planned.representation.is_empty() {
            Vec::new()
        } else {
            vec![selection::Selection::OnType {
                type_name: planned.type_name.clone(),
                children: Sel::requires_of(&planned.representation),
            }]
        };

        FetchNode {
            source_id: planner.data_sources[planned.source].id.clone(),
            kind: planned.kind,
            requires,
            variable_usages,
            operation: ast::print_operation(&document, operation),
            operation_kind,
            parent_arguments: planned.parent_arguments.clone(),
            response_key: planned.response_key.clone(),
        }
    }
}

fn emit_selection(
    document: &mut Document,
    source: &Document,
    selection: &Sel,
    used: &mut IndexSet<String>,
) -> ast::Selection {
    match selection {
        Sel::Field(field) => {
            let mut arguments = Vec::with_capacity(field.arguments.len());
            for (name, value) in &field.arguments {
                let value = match value {
                    ArgValue::Operation(value) => {
                        collect_variables(source, *value, used);
                        document.import_value(source, *value)
                    }
                    ArgValue::Variable(variable) => {
                        used.insert(variable.clone());
                        document.add_value(ast::Value::Variable(variable.clone()))
                    }
                    ArgValue::Constant(value) => document.add_json_value(value),
                };
                arguments.push(ast::Argument {
                    name: name.clone(),
                    value,
                });
            }
            let selection_set = field.selections.as_ref().map(|children| {
                let selections = children
                    .iter()
                    .map(|child| emit_selection(document, source, child, used))
                    .collect();
                document.add_selection_set(ast::SelectionSet { selections })
            });
            ast::Selection::Field(document.add_field(ast::Field {
                alias: field.alias.clone(),
                name: field.name.clone(),
                arguments,
                directives: Vec::new(),
                selection_set,
                position: Position::default(),
            }))
        }
        Sel::InlineFragment {
            type_condition,
            selections,
        } => {
            let selections = selections
                .iter()
                .map(|child| emit_selection(document, source, child, used))
                .collect();
            let selection_set = document.add_selection_set(ast::SelectionSet { selections });
            ast::Selection::InlineFragment(document.add_inline_fragment(ast::InlineFragment {
                type_condition: type_condition.clone(),
                directives: Vec::new(),
                selection_set,
                position: Position::default(),
            }))
        }
    }
}

fn collect_variables(document: &Document, value: ValueRef, used: &mut IndexSet<String>) {
    match document.value(value) {
        ast::Value::Variable(name) => {
            used.insert(name.clone());
        }
        ast::Value::List(items) => {
            for item in items {
                collect_variables(document, *item, used);
            }
        }
        ast::Value::Object(fields) => {
            for (_, field) in fields {
                collect_variables(document, *field, used);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::configuration::Configuration;

    const SCHEMA: &str = r#"
        scalar _Any
        type Query {
            me: User
            topProducts(first: Int): [Product]
        }
        type Mutation {
            login(username: String!): User
            addReview(body: String!): Review
        }
        type User {
            id: ID!
            username: String
            reviews: [Review]
            posts(userId: ID!): [Post]
        }
        type Post { title: String }
        type Product {
            upc: String!
            name: String
            price: Int
            weight: Int
            inStock: Boolean
            shippingEstimate: Int
            reviews: [Review]
        }
        type Review {
            id: ID!
            body: String
            author: User
            product: Product
        }
    "#;

    const DATA_SOURCES: &str = r#"
data_sources:
  - id: accounts
    kind: { type: graphql, url: "http://accounts/graphql" }
    root_nodes:
      - { type_name: Query, field_names: [me] }
      - { type_name: Mutation, field_names: [login] }
      - { type_name: User, field_names: [id, username] }
    federation:
      keys: [{ type_name: User, selection_set: id }]
  - id: products
    kind: { type: graphql, url: "http://products/graphql" }
    root_nodes:
      - { type_name: Query, field_names: [topProducts] }
      - { type_name: Product, field_names: [upc, name, price] }
    federation:
      keys: [{ type_name: Product, selection_set: upc }]
  - id: reviews
    kind: { type: graphql, url: "http://reviews/graphql" }
    root_nodes:
      - { type_name: Mutation, field_names: [addReview] }
      - { type_name: User, field_names: [reviews] }
      - { type_name: Product, field_names: [reviews] }
    child_nodes:
      - { type_name: Review, field_names: [id, body, author, product] }
      - { type_name: User, field_names: [id] }
      - { type_name: Product, field_names: [upc] }
    federation:
      keys:
        - { type_name: User, selection_set: id }
        - { type_name: Product, selection_set: upc }
  - id: inventory
    kind: { type: graphql, url: "http://inventory/graphql" }
    root_nodes:
      - { type_name: Product, field_names: [inStock, shippingEstimate] }
    federation:
      keys: [{ type_name: Product, selection_set: upc }]
      requires:
        - { type_name: Product, field_name: shippingEstimate, selection_set: "price weight" }
  - id: shipping
    kind: { type: graphql, url: "http://shipping/graphql" }
    root_nodes:
      - { type_name: Product, field_names: [weight] }
    federation:
      keys: [{ type_name: Product, selection_set: upc }]
  - id: posts
    kind: { type: graphql, url: "http://posts/graphql" }
    root_nodes:
      - { type_name: User, field_names: [posts] }
    child_nodes:
      - { type_name: Post, field_names: [title] }
field_configurations:
  - type_name: User
    field_name: posts
    requires_fields: [id]
    path: [postsByUser]
    arguments:
      - name: userId
        source: { type: parent_object, path: [id] }
"#;

    fn planner() -> Planner {
        let configuration = Configuration::from_yaml(DATA_SOURCES).unwrap();
        Planner::new(
            Arc::new(Schema::parse(SCHEMA).unwrap()),
            configuration.data_sources.clone(),
            configuration.field_configurations(),
        )
    }

    fn plan(query: &str) -> Result<QueryPlan, PlanningErrors> {
        let document = ast::parse_executable(query).unwrap();
        planner().plan(&document, None)
    }

    fn operations(node: &PlanNode, out: &mut Vec<(String, String)>) {
        match node {
            PlanNode::Sequence { nodes } | PlanNode::Parallel { nodes } => {
                nodes.iter().for_each(|node| operations(node, out))
            }
            PlanNode::Fetch(fetch) => out.push((fetch.source_id.clone(), fetch.operation.clone())),
            PlanNode::Flatten(flatten) => operations(&flatten.node, out),
        }
    }

    const ABSTRACT_SCHEMA: &str = r#"
        type Query { hero: Character me: User }
        interface Character { name: String }
        type Human implements Character { name: String height: Float }
        type Droid implements Character { name: String primaryFunction: String }
        union SearchResult = Human | Droid
        type User { id: ID! favorite: SearchResult }
    "#;

    fn abstract_plan(query: &str, data_sources: &str) -> Result<QueryPlan, PlanningErrors> {
        let configuration = Configuration::from_yaml(data_sources).unwrap();
        let planner = Planner::new(
            Arc::new(Schema::parse(ABSTRACT_SCHEMA).unwrap()),
            configuration.data_sources.clone(),
            configuration.field_configurations(),
        );
        planner.plan(&ast::parse_executable(query).unwrap(), None)
    }

    #[test]
    fn interface_fields_stay_with_the_parent_fetch() {
        let plan = abstract_plan(
            "{hero {name ... on Droid {primaryFunction}}}",
            r#"
data_sources:
  - id: star_wars
    kind: { type: graphql, url: "http://star-wars/graphql" }
    root_nodes:
      - { type_name: Query, field_names: [hero] }
      - { type_name: Human, field_names: [name, height] }
      - { type_name: Droid, field_names: [name, primaryFunction] }
"#,
        )
        .unwrap();

        let mut fetches = Vec::new();
        operations(&plan.root, &mut fetches);
        assert_eq!(fetches.len(), 1);
        let (source, operation) = &fetches[0];
        assert_eq!(source, "star_wars");
        assert!(operation.contains("name"), "{operation}");
        assert!(operation.contains("... on Droid {primaryFunction}"), "{operation}");
    }

    #[test]
    fn union_fields_of_objects_stay_with_the_parent_fetch() {
        let plan = abstract_plan(
            "{me {id favorite {... on Human {name}}}}",
            r#"
data_sources:
  - id: accounts
    kind: { type: graphql, url: "http://accounts/graphql" }
    root_nodes:
      - { type_name: Query, field_names: [me] }
      - { type_name: User, field_names: [id] }
      - { type_name: Human, field_names: [name] }
"#,
        )
        .unwrap();
        assert_eq!(plan.fetches(), 1);
    }

    #[test]
    fn interface_fields_declared_elsewhere_cross_a_boundary() {
        let errors = abstract_plan(
            "{hero {name}}",
            r#"
data_sources:
  - id: heroes
    kind: { type: graphql, url: "http://heroes/graphql" }
    root_nodes:
      - { type_name: Query, field_names: [hero] }
  - id: names
    kind: { type: graphql, url: "http://names/graphql" }
    root_nodes:
      - { type_name: Character, field_names: [name] }
"#,
        )
        .unwrap_err();
        assert_eq!(
            *errors.errors,
            vec![PlanningError::MissingFederationKey {
                source_id: "names".to_string(),
                type_name: "Character".to_string(),
            }]
        );
    }

    #[test]
    fn entity_fetches_follow_their_parent() {
        let plan = plan("{me {id username reviews {body product {name}}}}").unwrap();
        insta::assert_snapshot!(plan.to_string(), @r###"
        QueryPlan {
          Sequence {
            Fetch(source: "accounts", kind: Single) {
              query {me {id username __typename}}
            },
            Flatten(path: "/me") {
              Fetch(source: "reviews", kind: Entity) {
                query($representations: [_Any!]!) {_entities(representations: $representations) {... on User {reviews {body product {__typename upc}}}}}
              },
            },
            Flatten(path: "/me/reviews/@/product") {
              Fetch(source: "products", kind: BatchEntity) {
                query($representations: [_Any!]!) {_entities(representations: $representations) {... on Product {name}}}
              },
            },
          },
        }
        "###);
    }

    #[test]
    fn sibling_boundaries_share_entity_fetches() {
        let plan = plan("query($first: Int) {topProducts(first: $first) {name inStock reviews {body}}}")
            .unwrap();
        insta::assert_snapshot!(plan.to_string(), @r###"
        QueryPlan {
          Sequence {
            Fetch(source: "products", kind: Single) {
              query($first: Int) {topProducts(first: $first) {name __typename upc}}
            },
            Parallel {
              Flatten(path: "/topProducts/@") {
                Fetch(source: "inventory", kind: BatchEntity) {
                  query($representations: [_Any!]!) {_entities(representations: $representations) {... on Product {inStock}}}
                },
              },
              Flatten(path: "/topProducts/@") {
                Fetch(source: "reviews", kind: BatchEntity) {
                  query($representations: [_Any!]!) {_entities(representations: $representations) {... on Product {reviews {body}}}}
                },
              },
            },
          },
        }
        "###);
        assert_eq!(plan.fetches(), 3);
    }

    #[test]
    fn requires_from_a_third_source_runs_first() {
        let plan = plan("{topProducts {shippingEstimate}}").unwrap();
        let mut fetches = Vec::new();
        operations(&plan.root, &mut fetches);
        assert_eq!(
            fetches,
            vec![
                (
                    "products".to_string(),
                    "query {topProducts {__typename upc price}}".to_string()
                ),
                (
                    "shipping".to_string(),
                    "query($representations: [_Any!]!) {_entities(representations: $representations) {... on Product {weight}}}".to_string()
                ),
                (
                    "inventory".to_string(),
                    "query($representations: [_Any!]!) {_entities(representations: $representations) {... on Product {shippingEstimate}}}".to_string()
                ),
            ]
        );
        assert!(matches!(&plan.root, PlanNode::Sequence { nodes } if nodes.len() == 3));

        let PlanNode::Sequence { nodes } = &plan.root else {
            unreachable!()
        };
        let PlanNode::Flatten(flatten) = &nodes[2] else {
            panic!("expected a flatten node")
        };
        let PlanNode::Fetch(inventory) = flatten.node.as_ref() else {
            panic!("expected a fetch node")
        };
        assert_eq!(
            serde_json::to_value(&inventory.requires).unwrap(),
            serde_json::json!([{
                "kind": "on_type",
                "type_name": "Product",
                "children": [
                    {"kind": "field", "name": "__typename"},
                    {"kind": "field", "name": "upc"},
                    {"kind": "field", "name": "price"},
                    {"kind": "field", "name": "weight"},
                ]
            }])
        );
    }

    #[test]
    fn nested_fetch_binds_parent_arguments() {
        let plan = plan("{me {username posts {title}}}").unwrap();
        let mut fetches = Vec::new();
        operations(&plan.root, &mut fetches);
        assert_eq!(
            fetches,
            vec![
                ("accounts".to_string(), "query {me {username id}}".to_string()),
                (
                    "posts".to_string(),
                    "query($userId: ID!) {posts: postsByUser(userId: $userId) {title}}".to_string()
                ),
            ]
        );
        let PlanNode::Sequence { nodes } = &plan.root else {
            panic!("expected a sequence")
        };
        let PlanNode::Flatten(FlattenNode { path, node }) = &nodes[1] else {
            panic!("expected a flatten node")
        };
        assert_eq!(path, &Path::from("me"));
        let PlanNode::Fetch(fetch) = node.as_ref() else {
            panic!("expected a fetch node")
        };
        assert_eq!(fetch.kind, FetchKind::Nested);
        assert_eq!(fetch.response_key.as_deref(), Some("posts"));
        assert_eq!(
            fetch.parent_arguments,
            vec![ParentArgument {
                name: "userId".to_string(),
                path: vec!["id".to_string()]
            }]
        );
    }

    #[test]
    fn mutations_keep_their_order() {
        let plan = plan(
            r#"mutation($a: String!, $b: String!) {
                first: login(username: $a) {id}
                addReview(body: $b) {body}
                second: login(username: $a) {username}
            }"#,
        )
        .unwrap();
        let mut fetches = Vec::new();
        operations(&plan.root, &mut fetches);
        assert_eq!(
            fetches,
            vec![
                (
                    "accounts".to_string(),
                    "mutation($a: String!) {first: login(username: $a) {id}}".to_string()
                ),
                (
                    "reviews".to_string(),
                    "mutation($b: String!) {addReview(body: $b) {body}}".to_string()
                ),
                (
                    "accounts".to_string(),
                    "mutation($a: String!) {second: login(username: $a) {username}}".to_string()
                ),
            ]
        );
        assert!(matches!(plan.root, PlanNode::Sequence { .. }));
        assert!(plan.contains_mutations());
    }

    #[test]
    fn query_root_fields_are_grouped_by_source() {
        let plan = plan("{me {id} topProducts {upc} other: me {username}}").unwrap();
        let mut fetches = Vec::new();
        operations(&plan.root, &mut fetches);
        assert_eq!(
            fetches,
            vec![
                (
                    "accounts".to_string(),
                    "query {me {id} other: me {username}}".to_string()
                ),
                ("products".to_string(), "query {topProducts {upc}}".to_string()),
            ]
        );
        assert!(matches!(plan.root, PlanNode::Parallel { .. }));
    }

    #[test]
    fn collects_every_planning_error() {
        let configuration = Configuration::from_yaml(
            r#"
data_sources:
  - id: accounts
    kind: { type: graphql, url: "http://accounts/graphql" }
    root_nodes:
      - { type_name: Query, field_names: [me] }
      - { type_name: User, field_names: [id] }
  - id: reviews
    kind: { type: graphql, url: "http://reviews/graphql" }
    root_nodes:
      - { type_name: User, field_names: [reviews] }
"#,
        )
        .unwrap();
        let planner = Planner::new(
            Arc::new(Schema::parse(SCHEMA).unwrap()),
            configuration.data_sources,
            FieldConfigurations::default(),
        );
        let document =
            ast::parse_executable("{me {id reviews {body} username} topProducts {upc}}").unwrap();
        let errors = planner.plan(&document, None).unwrap_err();
        assert_eq!(
            errors.errors.as_ref(),
            &vec![
                PlanningError::MissingFederationKey {
                    source_id: "reviews".to_string(),
                    type_name: "User".to_string(),
                },
                PlanningError::MissingDataSource {
                    type_name: "User".to_string(),
                    field_name: "username".to_string(),
                },
                PlanningError::MissingRootDataSource {
                    type_name: "Query".to_string(),
                    field_name: "topProducts".to_string(),
                },
            ]
        );
    }

    #[test]
    fn rejects_unnormalized_documents() {
        let errors = plan("{me {...F}} fragment F on User {id}").unwrap_err();
        assert_eq!(
            errors.errors.as_ref(),
            &vec![PlanningError::UnnormalizedFragmentSpread {
                name: "F".to_string()
            }]
        );
    }

    #[test]
    fn invalid_key_selection_set() {
        let configuration = Configuration::from_yaml(
            r#"
data_sources:
  - id: accounts
    kind: { type: graphql, url: "http://accounts/graphql" }
    root_nodes:
      - { type_name: Query, field_names: [me] }
  - id: reviews
    kind: { type: graphql, url: "http://reviews/graphql" }
    root_nodes:
      - { type_name: User, field_names: [reviews] }
    federation:
      keys: [{ type_name: User, selection_set: "uuid" }]
"#,
        )
        .unwrap();
        let planner = Planner::new(
            Arc::new(Schema::parse(SCHEMA).unwrap()),
            configuration.data_sources,
            FieldConfigurations::default(),
        );
        let document = ast::parse_executable("{me {reviews {body}}}").unwrap();
        let errors = planner.plan(&document, None).unwrap_err();
        assert_eq!(
            errors.errors.as_ref(),
            &vec![PlanningError::InvalidSelectionSet {
                type_name: "User".to_string(),
                selection_set: "uuid".to_string(),
                reason: "unknown field 'uuid'".to_string(),
            }]
        );
    }
}
