//! Canonical single line printing.
//!
//! The printed form is stable: it is hashed into plan fingerprints and sent upstream as the
//! operation text of fetches.

use std::fmt::Write;

use super::*;

/// Prints one operation.
pub fn print_operation(document: &Document, operation: OperationRef) -> String {
    let mut out = String::new();
    Printer {
        document,
        out: &mut out,
    }
    .operation(document.operation(operation));
    out
}

/// Prints every definition of an executable document, in source order.
pub fn print_document(document: &Document) -> String {
    let mut out = String::new();
    let mut printer = Printer {
        document,
        out: &mut out,
    };
    for (i, definition) in document.definitions.iter().enumerate() {
        if i > 0 {
            printer.out.push(' ');
        }
        match definition {
            Definition::Operation(r) => printer.operation(document.operation(*r)),
            Definition::Fragment(r) => printer.fragment(document.fragment(*r)),
            Definition::Type(_) => {}
        }
    }
    out
}

pub(crate) fn print_value(document: &Document, value: ValueRef) -> String {
    let mut out = String::new();
    Printer {
        document,
        out: &mut out,
    }
    .value(value);
    out
}

pub(crate) fn print_type(document: &Document, ty: TypeRef) -> String {
    let mut out = String::new();
    Printer {
        document,
        out: &mut out,
    }
    .ty(ty);
    out
}

struct Printer<'a> {
    document: &'a Document,
    out: &'a mut String,
}

impl Printer<'_> {
    fn operation(&mut self, operation: &OperationDefinition) {
        let document = self.document;
        self.out.push_str(match operation.kind {
            OperationKind::Query => "query",
            OperationKind::Mutation => "mutation",
            OperationKind::Subscription => "subscription",
        });
        if let Some(name) = &operation.name {
            self.out.push(' ');
            self.out.push_str(name);
        }
        if !operation.variable_definitions.is_empty() {
            self.out.push('(');
            for (i, r) in operation.variable_definitions.iter().enumerate() {
                if i > 0 {
                    self.out.push_str(", ");
                }
                self.variable_definition(document.variable_definition(*r));
            }
            self.out.push(')');
        }
        self.directives(&operation.directives);
        self.out.push(' ');
        self.selection_set(operation.selection_set);
    }

    fn fragment(&mut self, fragment: &FragmentDefinition) {
        let _ = write!(
            self.out,
            "fragment {} on {}",
            fragment.name, fragment.type_condition
        );
        self.directives(&fragment.directives);
        self.out.push(' ');
        self.selection_set(fragment.selection_set);
    }

    fn variable_definition(&mut self, definition: &VariableDefinition) {
        self.out.push('$');
        self.out.push_str(&definition.name);
        self.out.push_str(": ");
        self.ty(definition.ty);
        if let Some(default_value) = definition.default_value {
            self.out.push_str(" = ");
            self.value(default_value);
        }
        self.directives(&definition.directives);
    }

    fn selection_set(&mut self, r: SelectionSetRef) {
        let document = self.document;
        self.out.push('{');
        for (i, selection) in document.selection_set(r).selections.iter().enumerate() {
            if i > 0 {
                self.out.push(' ');
            }
            match selection {
                Selection::Field(r) => self.field(document.field(*r)),
                Selection::InlineFragment(r) => {
                    let fragment = document.inline_fragment(*r);
                    self.out.push_str("...");
                    if let Some(type_condition) = &fragment.type_condition {
                        self.out.push_str(" on ");
                        self.out.push_str(type_condition);
                    }
                    self.directives(&fragment.directives);
                    self.out.push(' ');
                    self.selection_set(fragment.selection_set);
                }
                Selection::FragmentSpread(r) => {
                    let spread = document.fragment_spread(*r);
                    self.out.push_str("...");
                    self.out.push_str(&spread.name);
                    self.directives(&spread.directives);
                }
            }
        }
        self.out.push('}');
    }

    fn field(&mut self, field: &Field) {
        if let Some(alias) = &field.alias {
            self.out.push_str(alias);
            self.out.push_str(": ");
        }
        self.out.push_str(&field.name);
        self.arguments(&field.arguments);
        self.directives(&field.directives);
        if let Some(selection_set) = field.selection_set {
            self.out.push(' ');
            self.selection_set(selection_set);
        }
    }

    fn arguments(&mut self, arguments: &[Argument]) {
        if arguments.is_empty() {
            return;
        }
        self.out.push('(');
        for (i, argument) in arguments.iter().enumerate() {
            if i > 0 {
                self.out.push_str(", ");
            }
            self.out.push_str(&argument.name);
            self.out.push_str(": ");
            self.value(argument.value);
        }
        self.out.push(')');
    }

    fn directives(&mut self, directives: &[DirectiveRef]) {
        let document = self.document;
        for r in directives {
            let directive = document.directive(*r);
            self.out.push_str(" @");
            self.out.push_str(&directive.name);
            self.arguments(&directive.arguments);
        }
    }

    fn value(&mut self, r: ValueRef) {
        let document = self.document;
        match document.value(r) {
            Value::Variable(name) => {
                self.out.push('$');
                self.out.push_str(name);
            }
            Value::Int(text) | Value::Float(text) | Value::Enum(text) => self.out.push_str(text),
            Value::String(s) => {
                let _ = write!(
                    self.out,
                    "{}",
                    serde_json::Value::String(s.clone())
                );
            }
            Value::Boolean(b) => {
                let _ = write!(self.out, "{b}");
            }
            Value::Null => self.out.push_str("null"),
            Value::List(items) => {
                self.out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        self.out.push_str(", ");
                    }
                    self.value(*item);
                }
                self.out.push(']');
            }
            Value::Object(fields) => {
                self.out.push('{');
                for (i, (name, value)) in fields.iter().enumerate() {
                    if i > 0 {
                        self.out.push_str(", ");
                    }
                    self.out.push_str(name);
                    self.out.push_str(": ");
                    self.value(*value);
                }
                self.out.push('}');
            }
        }
    }

    fn ty(&mut self, r: TypeRef) {
        let document = self.document;
        match document.ty(r) {
            Type::Named(name) => self.out.push_str(name),
            Type::List(inner) => {
                self.out.push('[');
                self.ty(*inner);
                self.out.push(']');
            }
            Type::NonNull(inner) => {
                self.ty(*inner);
                self.out.push('!');
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::parse_executable;

    #[test]
    fn prints_canonical_form() {
        let document = parse_executable(
            r#"
            query MySearch($s: String!, $ids: [Int] = [1, 2]) {
              search(name: $s, filter: {exact: true, label: "a \"b\""}) {
                ... on Human { name @include(if: true) }
                ...DroidFields
              }
            }
            fragment DroidFields on Droid { primaryFunction }
            "#,
        )
        .unwrap();

        assert_eq!(
            print_document(&document),
            r#"query MySearch($s: String!, $ids: [Int] = [1, 2]) {search(name: $s, filter: {exact: true, label: "a \"b\""}) {... on Human {name @include(if: true)} ...DroidFields}} fragment DroidFields on Droid {primaryFunction}"#
        );
    }

    #[test]
    fn prints_anonymous_operation() {
        let document = parse_executable("{ hero { id name: nickname } }").unwrap();
        assert_eq!(
            print_operation(&document, OperationRef(0)),
            "query {hero {id name: nickname}}"
        );
    }
}
