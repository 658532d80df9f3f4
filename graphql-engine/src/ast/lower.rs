//! Lowering of the `apollo-parser` CST into the arena [`Document`].

use apollo_parser::Parser;
use apollo_parser::cst;
use apollo_parser::cst::CstNode;

use super::*;
use crate::error::ValidationErrors;
use crate::graphql;

/// Parses an executable document (operations and fragments).
pub(crate) fn parse_executable(source: &str) -> Result<Document, ValidationErrors> {
    let mut document = Document::default();
    parse_executable_into(source, &mut document)?;
    Ok(document)
}

/// Parses an executable document into a reusable arena.
pub(crate) fn parse_executable_into(
    source: &str,
    document: &mut Document,
) -> Result<(), ValidationErrors> {
    document.reset();
    let tree = Parser::new(source).parse();
    let lines = LineIndex::new(source);
    check_errors(tree.errors(), &lines)?;

    let mut lowering = Lowering {
        document,
        lines: &lines,
        errors: Vec::new(),
    };
    for definition in tree.document().definitions() {
        match definition {
            cst::Definition::OperationDefinition(operation) => lowering.operation(operation),
            cst::Definition::FragmentDefinition(fragment) => lowering.fragment(fragment),
            other => lowering.error(
                "type system definitions are not allowed in an executable document",
                other.syntax(),
            ),
        }
    }
    lowering.finish()
}

/// Parses a type system document (SDL).
///
/// Type extensions are merged into the definition they extend.
pub(crate) fn parse_type_system(source: &str) -> Result<Document, ValidationErrors> {
    let mut document = Document::default();
    let tree = Parser::new(source).parse();
    let lines = LineIndex::new(source);
    check_errors(tree.errors(), &lines)?;

    let mut lowering = Lowering {
        document: &mut document,
        lines: &lines,
        errors: Vec::new(),
    };
    for definition in tree.document().definitions() {
        lowering.type_system_definition(definition);
    }
    lowering.finish()?;
    Ok(document)
}

fn check_errors<'a>(
    errors: impl Iterator<Item = &'a apollo_parser::Error>,
    lines: &LineIndex,
) -> Result<(), ValidationErrors> {
    let errors: Vec<graphql::Error> = errors
        .map(|err| {
            let position = lines.position(err.index());
            graphql::Error::builder()
                .message(err.message().to_string())
                .location(graphql::Location {
                    line: position.line,
                    column: position.column,
                })
                .extension_code("GRAPHQL_PARSE_FAILED")
                .build()
        })
        .collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(ValidationErrors { errors })
    }
}

struct LineIndex {
    starts: Vec<usize>,
}

impl LineIndex {
    fn new(source: &str) -> Self {
        let mut starts = vec![0];
        starts.extend(
            source
                .char_indices()
                .filter(|(_, c)| *c == '\n')
                .map(|(i, _)| i + 1),
        );
        Self { starts }
    }

    fn position(&self, offset: usize) -> Position {
        let line = match self.starts.binary_search(&offset) {
            Ok(line) => line,
            Err(next) => next - 1,
        };
        Position {
            line: line as u32 + 1,
            column: (offset - self.starts[line]) as u32 + 1,
        }
    }
}

struct Lowering<'a> {
    document: &'a mut Document,
    lines: &'a LineIndex,
    errors: Vec<graphql::Error>,
}

fn text(name: Option<cst::Name>) -> String {
    name.map(|n| n.text().to_string()).unwrap_or_default()
}

fn named_type_text(ty: Option<cst::NamedType>) -> String {
    text(ty.and_then(|t| t.name()))
}

impl Lowering<'_> {
    fn finish(self) -> Result<(), ValidationErrors> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationErrors {
                errors: self.errors,
            })
        }
    }

    fn position(&self, node: &apollo_parser::SyntaxNode) -> Position {
        self.lines
            .position(u32::from(node.text_range().start()) as usize)
    }

    fn error(&mut self, message: &str, node: &apollo_parser::SyntaxNode) {
        let position = self.position(node);
        self.errors.push(
            graphql::Error::builder()
                .message(message)
                .location(graphql::Location {
                    line: position.line,
                    column: position.column,
                })
                .extension_code("GRAPHQL_PARSE_FAILED")
                .build(),
        );
    }

    fn operation(&mut self, operation: cst::OperationDefinition) {
        let kind = match operation.operation_type() {
            Some(ty) if ty.mutation_token().is_some() => OperationKind::Mutation,
            Some(ty) if ty.subscription_token().is_some() => OperationKind::Subscription,
            _ => OperationKind::Query,
        };
        let position = self.position(operation.syntax());
        let variable_definitions = operation
            .variable_definitions()
            .map(|defs| {
                defs.variable_definitions()
                    .map(|def| self.variable_definition(def))
                    .collect()
            })
            .unwrap_or_default();
        let directives = self.directives(operation.directives());
        let selection_set = self.selection_set(operation.selection_set());
        self.document.add_operation(OperationDefinition {
            kind,
            name: operation.name().map(|n| n.text().to_string()),
            variable_definitions,
            directives,
            selection_set,
            position,
        });
    }

    fn fragment(&mut self, fragment: cst::FragmentDefinition) {
        let position = self.position(fragment.syntax());
        let name = text(fragment.fragment_name().and_then(|n| n.name()));
        let type_condition = named_type_text(fragment.type_condition().and_then(|t| t.named_type()));
        let directives = self.directives(fragment.directives());
        let selection_set = self.selection_set(fragment.selection_set());
        self.document.add_fragment(FragmentDefinition {
            name,
            type_condition,
            directives,
            selection_set,
            position,
        });
    }

    fn variable_definition(&mut self, def: cst::VariableDefinition) -> VariableDefinitionRef {
        let name = text(def.variable().and_then(|v| v.name()));
        let ty = self.ty(def.ty());
        let default_value = def
            .default_value()
            .and_then(|d| d.value())
            .map(|v| self.value(v));
        let directives = self.directives(def.directives());
        self.document.add_variable_definition(VariableDefinition {
            name,
            ty,
            default_value,
            directives,
        })
    }

    fn selection_set(&mut self, set: Option<cst::SelectionSet>) -> SelectionSetRef {
        let selections = set
            .map(|set| {
                set.selections()
                    .map(|selection| self.selection(selection))
                    .collect()
            })
            .unwrap_or_default();
        self.document.add_selection_set(SelectionSet { selections })
    }

    fn selection(&mut self, selection: cst::Selection) -> Selection {
        match selection {
            cst::Selection::Field(field) => {
                let position = self.position(field.syntax());
                let arguments = self.arguments(field.arguments());
                let directives = self.directives(field.directives());
                let selection_set = field
                    .selection_set()
                    .map(|set| self.selection_set(Some(set)));
                Selection::Field(self.document.add_field(Field {
                    alias: field.alias().map(|a| text(a.name())),
                    name: text(field.name()),
                    arguments,
                    directives,
                    selection_set,
                    position,
                }))
            }
            cst::Selection::InlineFragment(fragment) => {
                let position = self.position(fragment.syntax());
                let type_condition = fragment
                    .type_condition()
                    .map(|t| named_type_text(t.named_type()));
                let directives = self.directives(fragment.directives());
                let selection_set = self.selection_set(fragment.selection_set());
                Selection::InlineFragment(self.document.add_inline_fragment(InlineFragment {
                    type_condition,
                    directives,
                    selection_set,
                    position,
                }))
            }
            cst::Selection::FragmentSpread(spread) => {
                let position = self.position(spread.syntax());
                let directives = self.directives(spread.directives());
                Selection::FragmentSpread(self.document.add_fragment_spread(FragmentSpread {
                    name: text(spread.fragment_name().and_then(|n| n.name())),
                    directives,
                    position,
                }))
            }
        }
    }

    fn arguments(&mut self, arguments: Option<cst::Arguments>) -> Vec<Argument> {
        arguments
            .map(|args| {
                args.arguments()
                    .filter_map(|arg| {
                        let value = arg.value()?;
                        Some(Argument {
                            name: text(arg.name()),
                            value: self.value(value),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn directives(&mut self, directives: Option<cst::Directives>) -> Vec<DirectiveRef> {
        directives
            .map(|dirs| {
                dirs.directives()
                    .map(|directive| {
                        let arguments = self.arguments(directive.arguments());
                        self.document.add_directive(Directive {
                            name: text(directive.name()),
                            arguments,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn value(&mut self, value: cst::Value) -> ValueRef {
        let value = match value {
            cst::Value::Variable(v) => Value::Variable(text(v.name())),
            cst::Value::StringValue(s) => Value::String(String::from(s)),
            cst::Value::FloatValue(f) => Value::Float(
                f.float_token()
                    .map(|t| t.text().to_string())
                    .unwrap_or_default(),
            ),
            cst::Value::IntValue(i) => Value::Int(
                i.int_token()
                    .map(|t| t.text().to_string())
                    .unwrap_or_default(),
            ),
            cst::Value::BooleanValue(b) => Value::Boolean(b.true_token().is_some()),
            cst::Value::NullValue(_) => Value::Null,
            cst::Value::EnumValue(e) => Value::Enum(text(e.name())),
            cst::Value::ListValue(l) => {
                Value::List(l.values().map(|v| self.value(v)).collect())
            }
            cst::Value::ObjectValue(o) => Value::Object(
                o.object_fields()
                    .filter_map(|field| {
                        let value = field.value()?;
                        Some((text(field.name()), self.value(value)))
                    })
                    .collect(),
            ),
        };
        self.document.add_value(value)
    }

    fn ty(&mut self, ty: Option<cst::Type>) -> TypeRef {
        let ty = match ty {
            Some(cst::Type::NamedType(named)) => Type::Named(text(named.name())),
            Some(cst::Type::ListType(list)) => Type::List(self.ty(list.ty())),
            Some(cst::Type::NonNullType(non_null)) => {
                let inner = match (non_null.named_type(), non_null.list_type()) {
                    (Some(named), _) => self.ty(Some(cst::Type::NamedType(named))),
                    (None, Some(list)) => self.ty(Some(cst::Type::ListType(list))),
                    (None, None) => self.document.add_named_type(String::new()),
                };
                Type::NonNull(inner)
            }
            None => Type::Named(String::new()),
        };
        self.document.add_type(ty)
    }

    fn input_values(
        &mut self,
        values: impl Iterator<Item = cst::InputValueDefinition>,
    ) -> Vec<InputValueDefinition> {
        values
            .map(|value| {
                let ty = self.ty(value.ty());
                let default_value = value
                    .default_value()
                    .and_then(|d| d.value())
                    .map(|v| self.value(v));
                InputValueDefinition {
                    name: text(value.name()),
                    ty,
                    default_value,
                }
            })
            .collect()
    }

    fn fields(&mut self, fields: Option<cst::FieldsDefinition>) -> Vec<FieldDefinition> {
        fields
            .map(|fields| {
                fields
                    .field_definitions()
                    .map(|field| {
                        let arguments = field
                            .arguments_definition()
                            .map(|args| self.input_values(args.input_value_definitions()))
                            .unwrap_or_default();
                        let ty = self.ty(field.ty());
                        FieldDefinition {
                            name: text(field.name()),
                            arguments,
                            ty,
                        }
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Returns the definition named `name`, creating it if this is the first mention.
    fn definition_mut(&mut self, kind: TypeDefinitionKind, name: String) -> &mut TypeDefinition {
        let existing = self
            .document
            .type_definitions
            .iter()
            .position(|def| def.name == name);
        let index = match existing {
            Some(index) => index,
            None => self
                .document
                .add_type_definition(TypeDefinition::new(kind, name))
                .index(),
        };
        &mut self.document.type_definitions[index]
    }

    fn type_system_definition(&mut self, definition: cst::Definition) {
        macro_rules! object_like {
            ($def:expr, $kind:expr) => {{
                let fields = self.fields($def.fields_definition());
                let interfaces: Vec<String> = $def
                    .implements_interfaces()
                    .iter()
                    .flat_map(|i| i.named_types().map(|t| text(t.name())))
                    .collect();
                let target = self.definition_mut($kind, text($def.name()));
                target.fields.extend(fields);
                target.interfaces.extend(interfaces);
            }};
        }

        macro_rules! union_like {
            ($def:expr) => {{
                let members: Vec<String> = $def
                    .union_member_types()
                    .iter()
                    .flat_map(|m| m.named_types().map(|t| text(t.name())))
                    .collect();
                self.definition_mut(TypeDefinitionKind::Union, text($def.name()))
                    .union_members
                    .extend(members);
            }};
        }

        macro_rules! enum_like {
            ($def:expr) => {{
                let values: Vec<String> = $def
                    .enum_values_definition()
                    .iter()
                    .flat_map(|values| {
                        values
                            .enum_value_definitions()
                            .map(|v| text(v.enum_value().and_then(|e| e.name())))
                    })
                    .collect();
                self.definition_mut(TypeDefinitionKind::Enum, text($def.name()))
                    .enum_values
                    .extend(values);
            }};
        }

        macro_rules! input_like {
            ($def:expr) => {{
                let fields = $def
                    .input_fields_definition()
                    .map(|f| self.input_values(f.input_value_definitions()))
                    .unwrap_or_default();
                self.definition_mut(TypeDefinitionKind::InputObject, text($def.name()))
                    .input_fields
                    .extend(fields);
            }};
        }

        match definition {
            cst::Definition::SchemaDefinition(schema) => {
                self.root_operation_types(schema.root_operation_type_definitions())
            }
            cst::Definition::SchemaExtension(schema) => {
                self.root_operation_types(schema.root_operation_type_definitions())
            }
            cst::Definition::ScalarTypeDefinition(scalar) => {
                self.definition_mut(TypeDefinitionKind::Scalar, text(scalar.name()));
            }
            cst::Definition::ScalarTypeExtension(_) => {}
            cst::Definition::ObjectTypeDefinition(def) => {
                object_like!(def, TypeDefinitionKind::Object)
            }
            cst::Definition::ObjectTypeExtension(def) => {
                object_like!(def, TypeDefinitionKind::Object)
            }
            cst::Definition::InterfaceTypeDefinition(def) => {
                object_like!(def, TypeDefinitionKind::Interface)
            }
            cst::Definition::InterfaceTypeExtension(def) => {
                object_like!(def, TypeDefinitionKind::Interface)
            }
            cst::Definition::UnionTypeDefinition(def) => union_like!(def),
            cst::Definition::UnionTypeExtension(def) => union_like!(def),
            cst::Definition::EnumTypeDefinition(def) => enum_like!(def),
            cst::Definition::EnumTypeExtension(def) => enum_like!(def),
            cst::Definition::InputObjectTypeDefinition(def) => input_like!(def),
            cst::Definition::InputObjectTypeExtension(def) => input_like!(def),
            cst::Definition::DirectiveDefinition(_) => {}
            cst::Definition::OperationDefinition(op) => self.error(
                "executable definitions are not allowed in a schema document",
                op.syntax(),
            ),
            cst::Definition::FragmentDefinition(fragment) => self.error(
                "executable definitions are not allowed in a schema document",
                fragment.syntax(),
            ),
        }
    }

    fn root_operation_types(
        &mut self,
        definitions: impl Iterator<Item = cst::RootOperationTypeDefinition>,
    ) {
        for definition in definitions {
            let name = named_type_text(definition.named_type());
            match definition.operation_type() {
                Some(ty) if ty.mutation_token().is_some() => {
                    self.document.root_operation_types.mutation = Some(name)
                }
                Some(ty) if ty.subscription_token().is_some() => {
                    self.document.root_operation_types.subscription = Some(name)
                }
                _ => self.document.root_operation_types.query = Some(name),
            }
        }
    }
}
