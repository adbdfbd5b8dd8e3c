//! Package declaration interpreter.
//!
//! A `package.js` is never executed. Its top-level statements are walked and
//! the recognised calls (`Package.describe`, `Package.onUse`, `Package.onTest`,
//! `Npm.depends`) are replayed against a [`PackageApi`]. Arguments must be
//! statically known: literals, arrays, objects, string concatenation and
//! top-level bindings initialised with such values.

use crate::error::{line_column, ConvertError, Result};
use crate::scope::parse_program;
use oxc_allocator::Allocator;
use oxc_ast::ast::{
    Argument, ArrayExpressionElement, BindingPattern, CallExpression, Expression,
    FormalParameters, ObjectPropertyKind, PropertyKey, Statement,
};
use oxc_span::GetSpan;
use oxc_syntax::operator::BinaryOperator;
use std::collections::{BTreeMap, HashMap};

/// Which callback of the declaration is being replayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    Use,
    Test,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Describe {
    pub name: Option<String>,
    pub version: Option<String>,
    pub description: Option<String>,
    pub prod_only: bool,
    pub dev_only: bool,
    pub test_only: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UseOptions {
    pub weak: bool,
    pub unordered: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExportOptions {
    pub test_only: bool,
    pub debug_only: bool,
    pub prod_only: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MainModuleOptions {
    pub lazy: bool,
}

/// The callback surface a declaration may use.
pub trait PackageApi {
    /// Called before the calls of an `onUse` or `onTest` callback.
    fn enter(&mut self, _section: Section) {}

    fn describe(&mut self, describe: Describe) -> Result<()>;

    fn use_packages(&mut self, specs: &[String], archs: &[String], options: UseOptions)
        -> Result<()>;

    fn imply(&mut self, specs: &[String], archs: &[String]) -> Result<()>;

    fn export(&mut self, symbols: &[String], archs: &[String], options: ExportOptions)
        -> Result<()>;

    fn add_files(&mut self, files: &[String], archs: &[String]) -> Result<()>;

    fn add_assets(&mut self, files: &[String], archs: &[String]) -> Result<()>;

    fn main_module(&mut self, file: &str, archs: &[String], options: MainModuleOptions)
        -> Result<()>;

    fn npm_depends(&mut self, dependencies: &BTreeMap<String, String>) -> Result<()>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// STATIC VALUES
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq)]
pub enum StaticValue {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    Str(String),
    Array(Vec<StaticValue>),
    Object(BTreeMap<String, StaticValue>),
}

impl StaticValue {
    fn truthy(&self) -> bool {
        match self {
            StaticValue::Undefined | StaticValue::Null => false,
            StaticValue::Bool(b) => *b,
            StaticValue::Number(n) => *n != 0.0 && !n.is_nan(),
            StaticValue::Str(s) => !s.is_empty(),
            StaticValue::Array(_) | StaticValue::Object(_) => true,
        }
    }

    fn as_text(&self) -> Option<String> {
        match self {
            StaticValue::Str(s) => Some(s.clone()),
            StaticValue::Number(n) if n.fract() == 0.0 => Some(format!("{}", *n as i64)),
            StaticValue::Number(n) => Some(n.to_string()),
            StaticValue::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// A string or an array of strings, as every list argument accepts.
    fn string_list(&self) -> Option<Vec<String>> {
        match self {
            StaticValue::Str(s) => Some(vec![s.clone()]),
            StaticValue::Array(items) => items
                .iter()
                .map(|item| match item {
                    StaticValue::Str(s) => Some(s.clone()),
                    _ => None,
                })
                .collect(),
            _ => None,
        }
    }

    fn flag(&self, key: &str) -> bool {
        match self {
            StaticValue::Object(map) => map.get(key).map(|v| v.truthy()).unwrap_or(false),
            _ => false,
        }
    }

    fn field_text(&self, key: &str) -> Option<String> {
        match self {
            StaticValue::Object(map) => map.get(key).and_then(|v| v.as_text()),
            _ => None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// INTERPRETER
// ═══════════════════════════════════════════════════════════════════════════════

/// Replay the declaration in `source` against `api`.
pub fn interpret_declaration(source: &str, file_path: &str, api: &mut dyn PackageApi) -> Result<()> {
    let allocator = Allocator::default();
    let (program, _mode) = parse_program(&allocator, source, file_path)?;
    let mut interpreter = Interpreter {
        source,
        file_path,
        bindings: HashMap::new(),
    };
    for statement in &program.body {
        interpreter.top_level(statement, api)?;
    }
    Ok(())
}

struct Interpreter<'s> {
    source: &'s str,
    file_path: &'s str,
    bindings: HashMap<String, StaticValue>,
}

impl<'s> Interpreter<'s> {
    fn error(&self, offset: u32, message: impl Into<String>) -> ConvertError {
        let (line, column) = line_column(self.source, offset as usize);
        ConvertError::declaration(
            self.file_path,
            format!("{} (at {}:{})", message.into(), line, column),
        )
    }

    fn bind_variables(&mut self, statement: &Statement<'_>) {
        let Statement::VariableDeclaration(declaration) = statement else {
            return;
        };
        for declarator in &declaration.declarations {
            if let (BindingPattern::BindingIdentifier(id), Some(init)) =
                (&declarator.id, &declarator.init)
            {
                if let Some(value) = self.eval(init) {
                    self.bindings.insert(id.name.to_string(), value);
                }
            }
        }
    }

    fn top_level(&mut self, statement: &Statement<'_>, api: &mut dyn PackageApi) -> Result<()> {
        match statement {
            Statement::VariableDeclaration(_) => {
                self.bind_variables(statement);
                Ok(())
            }
            Statement::BlockStatement(block) => {
                for inner in &block.body {
                    self.top_level(inner, api)?;
                }
                Ok(())
            }
            Statement::ExpressionStatement(expr) => match &expr.expression {
                Expression::CallExpression(call) => self.top_level_call(call, api),
                _ => Ok(()),
            },
            _ => {
                tracing::debug!(file = self.file_path, "skipping unsupported top-level statement");
                Ok(())
            }
        }
    }

    fn top_level_call(&mut self, call: &CallExpression<'_>, api: &mut dyn PackageApi) -> Result<()> {
        let Some((object, method)) = member_call(call) else {
            return Ok(());
        };
        match (object, method) {
            ("Package", "describe") => {
                let info = self.argument(call, 0)?.unwrap_or(StaticValue::Undefined);
                api.describe(Describe {
                    name: info.field_text("name"),
                    version: info.field_text("version"),
                    description: info
                        .field_text("summary")
                        .or_else(|| info.field_text("description")),
                    prod_only: info.flag("prodOnly"),
                    dev_only: info.flag("devOnly") || info.flag("debugOnly"),
                    test_only: info.flag("testOnly"),
                })
            }
            ("Package", "onUse") | ("Package", "on_use") => self.callback(call, Section::Use, api),
            ("Package", "onTest") | ("Package", "on_test") => {
                self.callback(call, Section::Test, api)
            }
            ("Npm", "depends") => {
                let deps = match self.argument(call, 0)? {
                    Some(StaticValue::Object(map)) => map
                        .into_iter()
                        .filter_map(|(name, value)| value.as_text().map(|v| (name, v)))
                        .collect(),
                    _ => return Err(self.error(call.span.start, "Npm.depends expects an object")),
                };
                api.npm_depends(&deps)
            }
            _ => {
                tracing::debug!(
                    file = self.file_path,
                    object,
                    method,
                    "ignoring declaration call"
                );
                Ok(())
            }
        }
    }

    fn callback(
        &mut self,
        call: &CallExpression<'_>,
        section: Section,
        api: &mut dyn PackageApi,
    ) -> Result<()> {
        let (params, statements) = match call.arguments.first().and_then(Argument::as_expression) {
            Some(Expression::FunctionExpression(func)) => match &func.body {
                Some(body) => (&func.params, &body.statements),
                None => return Ok(()),
            },
            Some(Expression::ArrowFunctionExpression(arrow)) => {
                (&arrow.params, &arrow.body.statements)
            }
            _ => return Err(self.error(call.span.start, "expected a callback function")),
        };
        let Some(api_name) = first_param_name(params) else {
            return Ok(());
        };
        api.enter(section);
        for statement in statements {
            self.callback_statement(statement, &api_name, api)?;
        }
        Ok(())
    }

    fn callback_statement(
        &mut self,
        statement: &Statement<'_>,
        api_name: &str,
        api: &mut dyn PackageApi,
    ) -> Result<()> {
        match statement {
            Statement::VariableDeclaration(_) => {
                self.bind_variables(statement);
                Ok(())
            }
            Statement::BlockStatement(block) => {
                for inner in &block.body {
                    self.callback_statement(inner, api_name, api)?;
                }
                Ok(())
            }
            Statement::ExpressionStatement(expr) => match &expr.expression {
                Expression::CallExpression(call) => self.api_call(call, api_name, api),
                _ => Ok(()),
            },
            _ => {
                tracing::debug!(file = self.file_path, "skipping unsupported statement in callback");
                Ok(())
            }
        }
    }

    fn api_call(&mut self, call: &CallExpression<'_>, api_name: &str, api: &mut dyn PackageApi) -> Result<()> {
        let Some((object, method)) = member_call(call) else {
            return Ok(());
        };
        if object != api_name {
            return Ok(());
        }
        match method {
            "use" => {
                let (names, archs, options) = self.list_arch_options(call)?;
                api.use_packages(
                    &names,
                    &archs,
                    UseOptions {
                        weak: options.flag("weak"),
                        unordered: options.flag("unordered"),
                    },
                )
            }
            "imply" => {
                let (names, archs, _) = self.list_arch_options(call)?;
                api.imply(&names, &archs)
            }
            "export" => {
                let (symbols, archs, options) = self.list_arch_options(call)?;
                api.export(
                    &symbols,
                    &archs,
                    ExportOptions {
                        test_only: options.flag("testOnly"),
                        debug_only: options.flag("debugOnly"),
                        prod_only: options.flag("prodOnly"),
                    },
                )
            }
            "addFiles" | "add_files" => {
                let (files, archs, _) = self.list_arch_options(call)?;
                api.add_files(&files, &archs)
            }
            "addAssets" => {
                let (files, archs, _) = self.list_arch_options(call)?;
                api.add_assets(&files, &archs)
            }
            "mainModule" => {
                let (files, archs, options) = self.list_arch_options(call)?;
                let [file] = files.as_slice() else {
                    return Err(self.error(call.span.start, "mainModule expects a single file"));
                };
                api.main_module(
                    file,
                    &archs,
                    MainModuleOptions {
                        lazy: options.flag("lazy"),
                    },
                )
            }
            other => {
                tracing::debug!(file = self.file_path, method = other, "ignoring api call");
                Ok(())
            }
        }
    }

    /// `(list, archs?, options?)`; an object in second place is the options.
    fn list_arch_options(
        &self,
        call: &CallExpression<'_>,
    ) -> Result<(Vec<String>, Vec<String>, StaticValue)> {
        let first = self.argument(call, 0)?.unwrap_or(StaticValue::Undefined);
        let list = first
            .string_list()
            .ok_or_else(|| self.error(call.span.start, "expected a string or array of strings"))?;
        let second = self.argument(call, 1)?;
        let third = self.argument(call, 2)?;
        let (archs, options) = match second {
            Some(options @ StaticValue::Object(_)) => (Vec::new(), options),
            Some(StaticValue::Undefined) | Some(StaticValue::Null) | None => {
                (Vec::new(), third.unwrap_or(StaticValue::Undefined))
            }
            Some(value) => {
                let archs = value.string_list().ok_or_else(|| {
                    self.error(call.span.start, "expected architecture name or list")
                })?;
                (archs, third.unwrap_or(StaticValue::Undefined))
            }
        };
        Ok((list, archs, options))
    }

    fn argument(&self, call: &CallExpression<'_>, index: usize) -> Result<Option<StaticValue>> {
        let Some(argument) = call.arguments.get(index) else {
            return Ok(None);
        };
        let Some(expr) = argument.as_expression() else {
            return Err(self.error(argument.span().start, "spread arguments are not supported"));
        };
        self.eval(expr)
            .map(Some)
            .ok_or_else(|| self.error(expr.span().start, "argument is not a static value"))
    }

    fn eval(&self, expr: &Expression<'_>) -> Option<StaticValue> {
        match expr {
            Expression::StringLiteral(s) => Some(StaticValue::Str(s.value.to_string())),
            Expression::NumericLiteral(n) => Some(StaticValue::Number(n.value)),
            Expression::BooleanLiteral(b) => Some(StaticValue::Bool(b.value)),
            Expression::NullLiteral(_) => Some(StaticValue::Null),
            Expression::TemplateLiteral(tpl) if tpl.expressions.is_empty() => tpl
                .quasis
                .first()
                .and_then(|q| q.value.cooked.as_ref())
                .map(|cooked| StaticValue::Str(cooked.to_string())),
            Expression::Identifier(id) if id.name == "undefined" => Some(StaticValue::Undefined),
            Expression::Identifier(id) => self.bindings.get(&id.name.to_string()).cloned(),
            Expression::ParenthesizedExpression(paren) => self.eval(&paren.expression),
            Expression::BinaryExpression(bin) if bin.operator == BinaryOperator::Addition => {
                let left = self.eval(&bin.left)?.as_text()?;
                let right = self.eval(&bin.right)?.as_text()?;
                Some(StaticValue::Str(left + &right))
            }
            Expression::ArrayExpression(arr) => {
                let mut items = Vec::new();
                for element in &arr.elements {
                    match element {
                        ArrayExpressionElement::SpreadElement(spread) => {
                            match self.eval(&spread.argument)? {
                                StaticValue::Array(inner) => items.extend(inner),
                                _ => return None,
                            }
                        }
                        ArrayExpressionElement::Elision(_) => items.push(StaticValue::Undefined),
                        other => items.push(self.eval(other.as_expression()?)?),
                    }
                }
                Some(StaticValue::Array(items))
            }
            Expression::ObjectExpression(obj) => {
                let mut map = BTreeMap::new();
                for property in &obj.properties {
                    match property {
                        ObjectPropertyKind::ObjectProperty(p) if !p.computed => {
                            let key = match &p.key {
                                PropertyKey::StaticIdentifier(id) => id.name.to_string(),
                                PropertyKey::StringLiteral(s) => s.value.to_string(),
                                _ => return None,
                            };
                            map.insert(key, self.eval(&p.value)?);
                        }
                        ObjectPropertyKind::SpreadProperty(spread) => {
                            match self.eval(&spread.argument)? {
                                StaticValue::Object(inner) => map.extend(inner),
                                _ => return None,
                            }
                        }
                        _ => return None,
                    }
                }
                Some(StaticValue::Object(map))
            }
            _ => None,
        }
    }
}

/// `Object.method(...)` with an identifier object.
fn member_call<'c>(call: &'c CallExpression<'_>) -> Option<(&'c str, &'c str)> {
    let Expression::StaticMemberExpression(member) = &call.callee else {
        return None;
    };
    let Expression::Identifier(object) = &member.object else {
        return None;
    };
    Some((object.name.as_str(), member.property.name.as_str()))
}

fn first_param_name(params: &FormalParameters<'_>) -> Option<String> {
    match &params.items.first()?.pattern {
        BindingPattern::BindingIdentifier(id) => Some(id.name.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default, Debug)]
    struct Recorder {
        section: Option<Section>,
        calls: Vec<String>,
        describe: Option<Describe>,
        npm: BTreeMap<String, String>,
    }

    impl Recorder {
        fn log(&mut self, text: String) {
            let prefix = match self.section {
                Some(Section::Test) => "test:",
                _ => "",
            };
            self.calls.push(format!("{}{}", prefix, text));
        }
    }

    impl PackageApi for Recorder {
        fn enter(&mut self, section: Section) {
            self.section = Some(section);
        }
        fn describe(&mut self, describe: Describe) -> Result<()> {
            self.describe = Some(describe);
            Ok(())
        }
        fn use_packages(&mut self, specs: &[String], archs: &[String], options: UseOptions) -> Result<()> {
            self.log(format!("use {:?} {:?} weak={} unordered={}", specs, archs, options.weak, options.unordered));
            Ok(())
        }
        fn imply(&mut self, specs: &[String], archs: &[String]) -> Result<()> {
            self.log(format!("imply {:?} {:?}", specs, archs));
            Ok(())
        }
        fn export(&mut self, symbols: &[String], archs: &[String], options: ExportOptions) -> Result<()> {
            self.log(format!("export {:?} {:?} test={}", symbols, archs, options.test_only));
            Ok(())
        }
        fn add_files(&mut self, files: &[String], archs: &[String]) -> Result<()> {
            self.log(format!("files {:?} {:?}", files, archs));
            Ok(())
        }
        fn add_assets(&mut self, files: &[String], archs: &[String]) -> Result<()> {
            self.log(format!("assets {:?} {:?}", files, archs));
            Ok(())
        }
        fn main_module(&mut self, file: &str, archs: &[String], options: MainModuleOptions) -> Result<()> {
            self.log(format!("main {} {:?} lazy={}", file, archs, options.lazy));
            Ok(())
        }
        fn npm_depends(&mut self, dependencies: &BTreeMap<String, String>) -> Result<()> {
            self.npm = dependencies.clone();
            Ok(())
        }
    }

    const DECLARATION: &str = r#"
Package.describe({
  name: "beta",
  version: "1.2.0",
  summary: "Beta " + "package",
  devOnly: true,
});

Npm.depends({ "left-pad": "1.3.0" });

var both = ["client", "server"];

Package.onUse(function (api) {
  api.versionsFrom("1.0");
  api.use(["alpha@1.0.0", "ecmascript"]);
  api.use("gamma", "client", { weak: true });
  api.imply("alpha", both);
  api.export("Beta");
  api.export(["BetaTest"], { testOnly: true });
  api.addFiles(["beta.js"], both);
  api.addAssets("logo.png", "client");
  api.mainModule("main.js", "server", { lazy: true });
});

Package.onTest((api) => {
  api.use(["beta", "tinytest"]);
  api.addFiles(`beta-tests.js`);
});
"#;

    #[test]
    fn test_declaration_is_replayed_in_order() {
        let mut recorder = Recorder::default();
        interpret_declaration(DECLARATION, "beta/package.js", &mut recorder).unwrap();

        let describe = recorder.describe.clone().unwrap();
        assert_eq!(describe.name.as_deref(), Some("beta"));
        assert_eq!(describe.version.as_deref(), Some("1.2.0"));
        assert_eq!(describe.description.as_deref(), Some("Beta package"));
        assert!(describe.dev_only && !describe.prod_only);
        assert_eq!(recorder.npm.get("left-pad").map(String::as_str), Some("1.3.0"));

        assert_eq!(
            recorder.calls,
            vec![
                r#"use ["alpha@1.0.0", "ecmascript"] [] weak=false unordered=false"#,
                r#"use ["gamma"] ["client"] weak=true unordered=false"#,
                r#"imply ["alpha"] ["client", "server"]"#,
                r#"export ["Beta"] [] test=false"#,
                r#"export ["BetaTest"] [] test=true"#,
                r#"files ["beta.js"] ["client", "server"]"#,
                r#"assets ["logo.png"] ["client"]"#,
                r#"main main.js ["server"] lazy=true"#,
                r#"test:use ["beta", "tinytest"] [] weak=false unordered=false"#,
                r#"test:files ["beta-tests.js"] []"#,
            ]
        );
    }

    #[test]
    fn test_dynamic_argument_is_rejected_with_location() {
        let src = "Package.onUse(function (api) {\n  api.use(computeDeps());\n});\n";
        let err = interpret_declaration(src, "bad/package.js", &mut Recorder::default()).unwrap_err();
        let text = err.to_string();
        assert!(text.contains("bad/package.js"));
        assert!(text.contains("at 2:11"), "{}", text);
    }

    #[test]
    fn test_unknown_statements_are_skipped() {
        let src = "if (process.env.X) { Package.describe({ name: 'x' }); }\nSomething.else();\n";
        let mut recorder = Recorder::default();
        interpret_declaration(src, "x/package.js", &mut recorder).unwrap();
        assert!(recorder.describe.is_none());
        assert!(recorder.calls.is_empty());
    }

    #[test]
    fn test_main_module_requires_single_file() {
        let src = "Package.onUse(function (api) { api.mainModule(['a.js', 'b.js']); });";
        assert!(interpret_declaration(src, "m/package.js", &mut Recorder::default()).is_err());
    }
}
