//! Evaluates a parsed template against a data value

use super::functions::FuncMap;
use super::parser::{Arg, Command, Node, Pipeline};
use super::value::Value;

const MAX_DEPTH: usize = 100;

/// Renders `nodes` with `data` bound to both `.` and `$`
pub fn execute(nodes: &[Node], data: &Value, funcs: &FuncMap) -> Result<String, String> {
    let mut state = State {
        funcs,
        vars: vec![(String::new(), data.clone())],
        depth: 0,
    };
    let mut out = String::new();
    state.walk(nodes, data, &mut out)?;
    Ok(out)
}

struct State<'a> {
    funcs: &'a FuncMap,
    /// Scoped variable stack; `""` is the root `$`
    vars: Vec<(String, Value)>,
    depth: usize,
}

impl State<'_> {
    fn walk(&mut self, nodes: &[Node], dot: &Value, out: &mut String) -> Result<(), String> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err("exceeded maximum template depth".to_string());
        }
        for node in nodes {
            self.walk_node(node, dot, out)?;
        }
        self.depth -= 1;
        Ok(())
    }

    fn walk_node(&mut self, node: &Node, dot: &Value, out: &mut String) -> Result<(), String> {
        match node {
            Node::Text(text) => out.push_str(text),
            Node::Action(pipe) => {
                let value = self.eval_pipeline(pipe, dot)?;
                if pipe.decl.is_empty() {
                    print_value(&value, out);
                }
            }
            Node::If {
                branches,
                otherwise,
            } => {
                let mark = self.vars.len();
                let mut taken = false;
                for (pipe, body) in branches {
                    if self.eval_pipeline(pipe, dot)?.is_truthy() {
                        self.walk(body, dot, out)?;
                        taken = true;
                        break;
                    }
                }
                if !taken {
                    self.walk(otherwise, dot, out)?;
                }
                self.vars.truncate(mark);
            }
            Node::With {
                pipe,
                body,
                otherwise,
            } => {
                let mark = self.vars.len();
                let value = self.eval_pipeline(pipe, dot)?;
                if value.is_truthy() {
                    self.walk(body, &value, out)?;
                } else {
                    self.walk(otherwise, dot, out)?;
                }
                self.vars.truncate(mark);
            }
            Node::Range {
                pipe,
                body,
                otherwise,
            } => self.walk_range(pipe, body, otherwise, dot, out)?,
        }
        Ok(())
    }

    fn walk_range(
        &mut self,
        pipe: &Pipeline,
        body: &[Node],
        otherwise: &[Node],
        dot: &Value,
        out: &mut String,
    ) -> Result<(), String> {
        let undeclared = Pipeline {
            decl: Vec::new(),
            assign: false,
            commands: pipe.commands.clone(),
        };
        let value = self.eval_pipeline(&undeclared, dot)?;
        let entries: Vec<(Value, Value)> = match value {
            Value::List(items) => items
                .into_iter()
                .enumerate()
                .map(|(i, v)| (Value::Int(i64::try_from(i).unwrap_or(i64::MAX)), v))
                .collect(),
            Value::Map(map) => map.into_iter().map(|(k, v)| (Value::Str(k), v)).collect(),
            Value::Int(n) => (0..n.max(0)).map(|i| (Value::Int(i), Value::Int(i))).collect(),
            Value::Nil => Vec::new(),
            other => return Err(format!("range can't iterate over {other}")),
        };

        if entries.is_empty() {
            return self.walk(otherwise, dot, out);
        }
        for (key, item) in entries {
            let mark = self.vars.len();
            match pipe.decl.as_slice() {
                [v] => self.vars.push((v.clone(), item.clone())),
                [k, v] => {
                    self.vars.push((k.clone(), key));
                    self.vars.push((v.clone(), item.clone()));
                }
                _ => {}
            }
            self.walk(body, &item, out)?;
            self.vars.truncate(mark);
        }
        Ok(())
    }

    fn eval_pipeline(&mut self, pipe: &Pipeline, dot: &Value) -> Result<Value, String> {
        let mut value: Option<Value> = None;
        for command in &pipe.commands {
            value = Some(self.eval_command(command, dot, value)?);
        }
        let value = value.unwrap_or(Value::Nil);

        for name in &pipe.decl {
            if pipe.assign {
                let slot = self
                    .vars
                    .iter_mut()
                    .rev()
                    .find(|(n, _)| n == name)
                    .ok_or_else(|| format!("undefined variable: ${name}"))?;
                slot.1 = value.clone();
            } else {
                self.vars.push((name.clone(), value.clone()));
            }
        }
        Ok(value)
    }

    fn eval_command(&mut self, command: &Command, dot: &Value, piped: Option<Value>) -> Result<Value, String> {
        let Some((first, rest)) = command.args.split_first() else {
            return Err("empty command".to_string());
        };

        if let Arg::Function(name) = first {
            let mut args = rest
                .iter()
                .map(|arg| self.eval_arg(arg, dot))
                .collect::<Result<Vec<_>, _>>()?;
            args.extend(piped);
            return self.call(name, &args);
        }

        if !rest.is_empty() || piped.is_some() {
            return Err(format!("can't give argument to non-function {}", describe(first)));
        }
        self.eval_arg(first, dot)
    }

    fn eval_arg(&mut self, arg: &Arg, dot: &Value) -> Result<Value, String> {
        match arg {
            Arg::Dot => Ok(dot.clone()),
            Arg::Field(chain) => walk_fields(dot, chain),
            Arg::Variable(name, chain) => {
                let value = self
                    .vars
                    .iter()
                    .rev()
                    .find(|(n, _)| n == name)
                    .map(|(_, v)| v.clone())
                    .ok_or_else(|| format!("undefined variable: ${name}"))?;
                walk_fields(&value, chain)
            }
            Arg::Function(name) => self.call(name, &[]),
            Arg::Literal(value) => Ok(value.clone()),
            Arg::Sub(pipe, chain) => {
                let mark = self.vars.len();
                let value = self.eval_pipeline(pipe, dot);
                self.vars.truncate(mark);
                walk_fields(&value?, chain)
            }
        }
    }

    fn call(&self, name: &str, args: &[Value]) -> Result<Value, String> {
        let function = self
            .funcs
            .get(name)
            .ok_or_else(|| format!("function {name:?} not defined"))?;
        function(args).map_err(|e| format!("error calling {name}: {e}"))
    }
}

fn walk_fields(value: &Value, chain: &[String]) -> Result<Value, String> {
    let mut current = value.clone();
    for name in chain {
        current = match current {
            Value::Map(mut map) => map.remove(name).unwrap_or(Value::Nil),
            Value::Nil => Value::Nil,
            other => {
                return Err(format!(
                    "can't evaluate field {name} in type {}",
                    other.type_name()
                ))
            }
        };
    }
    Ok(current)
}

fn describe(arg: &Arg) -> String {
    match arg {
        Arg::Dot => ".".to_string(),
        Arg::Field(chain) => format!(".{}", chain.join(".")),
        Arg::Variable(name, chain) if chain.is_empty() => format!("${name}"),
        Arg::Variable(name, chain) => format!("${name}.{}", chain.join(".")),
        Arg::Function(name) => name.clone(),
        Arg::Literal(value) => value.to_string(),
        Arg::Sub(..) => "(pipeline)".to_string(),
    }
}

fn print_value(value: &Value, out: &mut String) {
    match value {
        Value::Nil => out.push_str("<no value>"),
        other => out.push_str(&other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::template::parser::parse;

    fn render(text: &str, data: &Value) -> Result<String, String> {
        let funcs = FuncMap::standard();
        let nodes = parse(text, &|name| funcs.contains(name))?;
        execute(&nodes, data, &funcs)
    }

    fn data() -> Value {
        Value::map([
            ("Name", Value::from("web")),
            (
                "Values",
                Value::map([("cpu", Value::Int(500)), ("mode", Value::from("fast"))]),
            ),
            ("Items", Value::List(vec![Value::Int(1), Value::Int(2)])),
        ])
    }

    #[test]
    fn test_fields_and_missing_values() {
        assert_eq!(render("{{ .Name }}/{{ .Values.cpu }}", &data()).unwrap(), "web/500");
        assert_eq!(render("{{ .Missing }}", &data()).unwrap(), "<no value>");
        assert!(render("{{ .Name.First }}", &data()).is_err());
    }

    #[test]
    fn test_control_flow() {
        let text = "{{ if eq .Values.mode \"slow\" }}s{{ else if eq .Values.mode \"fast\" }}f{{ else }}x{{ end }}";
        assert_eq!(render(text, &data()).unwrap(), "f");
        assert_eq!(render("{{ with .Values }}{{ .cpu }}{{ end }}", &data()).unwrap(), "500");
        assert_eq!(render("{{ with .Missing }}a{{ else }}b{{ end }}", &data()).unwrap(), "b");
    }

    #[test]
    fn test_range_and_variables() {
        let text = "{{ range $i, $v := .Items }}{{ $i }}={{ $v }};{{ end }}";
        assert_eq!(render(text, &data()).unwrap(), "0=1;1=2;");
        assert_eq!(render("{{ range .Nothing }}x{{ else }}empty{{ end }}", &data()).unwrap(), "empty");
        assert_eq!(render("{{ $n := .Name }}{{ $n }}-{{ $.Name }}", &data()).unwrap(), "web-web");
    }

    #[test]
    fn test_pipelines_pass_final_argument() {
        assert_eq!(render("{{ .Name | upper | quote }}", &data()).unwrap(), "\"WEB\"");
        assert_eq!(render("{{ (.Values).cpu }}", &data()).unwrap(), "500");
        assert!(render("{{ .Name 1 }}", &data()).is_err());
    }
}
