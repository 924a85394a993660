//! 文本形式的工具调用解析
//!
//! 部分模型无法输出原生工具调用，而是在 Markdown 代码块中写出 JSON 或类似函数调用的文本：
//! `transfer_to_agent(agent_name='scientist', count=42, flag=true)`。
//! 这里先按分隔符取出第一个代码块，再用递归下降解析器解析调用语法：
//!
//! ```text
//! call    := ident ws* '(' args ')'
//!          | "transfer_to_agent" ws* '(' ws* string ws* ','? ws* ')'   (位置参数即 agentName)
//! args    := ws* (kv (ws* ',' ws* kv)* (ws* ',')?)? ws*
//! kv      := ident ws* '=' ws* literal
//! literal := string | number | bool
//! string  := '\'' chars '\'' | '"' chars '"'      (支持 \\ \' \" \n \t \r 转义)
//! number  := '-'? digits ('.' digits)? (('e'|'E') ('+'|'-')? digits)?
//! bool    := true | false | True | False
//! ```
//!
//! 解析失败不是错误：调用方把代码块当作普通文本处理。

use serde_json::{Map, Number, Value};
use thiserror::Error;

use crate::llm::{ToolInvocation, AGENT_NAME_KEY, TRANSFER_TOOL};

const FENCE: &str = "```";

/// 代码块：可选的语言标记与去除首尾空白的内容
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FencedBlock<'a> {
    pub tag: Option<&'a str>,
    pub content: &'a str,
}

/// 取出文本中第一个完整的 ``` 代码块（有无语言标记均可）
pub fn first_fenced_block(text: &str) -> Option<FencedBlock<'_>> {
    let open = text.find(FENCE)?;
    let body_start = open + FENCE.len();
    let close = text[body_start..].find(FENCE)?;
    let inner = &text[body_start..body_start + close];

    if let Some((first_line, rest)) = inner.split_once('\n') {
        let candidate = first_line.trim();
        if candidate.is_empty() {
            return Some(FencedBlock {
                tag: None,
                content: rest.trim(),
            });
        }
        if is_fence_tag(candidate) {
            return Some(FencedBlock {
                tag: Some(candidate),
                content: rest.trim(),
            });
        }
    }
    Some(FencedBlock {
        tag: None,
        content: inner.trim(),
    })
}

fn is_fence_tag(s: &str) -> bool {
    s.chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '+' | '.'))
}

/// 从文本的第一个代码块中恢复工具调用：先尝试 JSON，再尝试调用语法；都不匹配返回 None
pub fn extract_tool_call(text: &str) -> Option<ToolInvocation> {
    let block = first_fenced_block(text)?;
    if block.content.is_empty() {
        return None;
    }
    if let Some(invocation) = invocation_from_json(block.content) {
        return Some(invocation);
    }
    match parse_call(block.content) {
        Ok(call) => Some(call.into_invocation()),
        Err(e) => {
            tracing::debug!("fenced block is not a call expression: {}", e);
            None
        }
    }
}

/// JSON 形式：{"name"|"tool": "...", "args"|"arguments"|"parameters": {...}}，
/// 或 OpenAI 风格 {"function": {"name": ..., "arguments": "..."}}
fn invocation_from_json(content: &str) -> Option<ToolInvocation> {
    let value: Value = serde_json::from_str(content).ok()?;
    invocation_from_object(value.as_object()?)
}

fn invocation_from_object(obj: &Map<String, Value>) -> Option<ToolInvocation> {
    if let Some(Value::Object(inner)) = obj.get("function") {
        return invocation_from_object(inner);
    }
    let name = ["name", "tool", "function"]
        .iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_str))
        .map(str::trim)
        .filter(|n| !n.is_empty())?;
    let args = ["args", "arguments", "parameters"]
        .iter()
        .find_map(|k| match obj.get(*k)? {
            Value::Object(map) => Some(map.clone()),
            Value::String(raw) => serde_json::from_str::<Map<String, Value>>(raw).ok(),
            _ => None,
        })
        .unwrap_or_default();
    Some(ToolInvocation::new(name, args).normalized())
}

/// 调用语法中的字面量
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Str(String),
    Number(Number),
    Bool(bool),
}

impl Literal {
    pub fn into_value(self) -> Value {
        match self {
            Literal::Str(s) => Value::String(s),
            Literal::Number(n) => Value::Number(n),
            Literal::Bool(b) => Value::Bool(b),
        }
    }
}

/// 解析结果：函数名与按出现顺序排列的参数
#[derive(Debug, Clone, PartialEq)]
pub struct CallExpr {
    pub name: String,
    pub args: Vec<(String, Literal)>,
}

impl CallExpr {
    /// 转为 ToolInvocation；重复的参数名以最后一次为准
    pub fn into_invocation(self) -> ToolInvocation {
        let args: Map<String, Value> = self
            .args
            .into_iter()
            .map(|(k, v)| (k, v.into_value()))
            .collect();
        ToolInvocation::new(self.name, args).normalized()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("unexpected end of input")]
    UnexpectedEnd,

    #[error("unexpected '{found}' at offset {offset}, expected {expected}")]
    Unexpected {
        offset: usize,
        found: char,
        expected: &'static str,
    },

    #[error("invalid number literal '{0}'")]
    InvalidNumber(String),
}

/// 解析 `name(key=value, ...)`，输入首尾空白会被忽略
pub fn parse_call(input: &str) -> Result<CallExpr, ParseError> {
    let mut parser = Parser::new(input.trim());
    let call = parser.call()?;
    parser.skip_ws();
    match parser.peek() {
        None => Ok(call),
        Some(found) => Err(ParseError::Unexpected {
            offset: parser.pos,
            found,
            expected: "end of input",
        }),
    }
}

struct Parser<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str) -> Self {
        Self { src, pos: 0 }
    }

    fn peek(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.bump();
        }
    }

    fn unexpected(&self, expected: &'static str) -> ParseError {
        match self.peek() {
            Some(found) => ParseError::Unexpected {
                offset: self.pos,
                found,
                expected,
            },
            None => ParseError::UnexpectedEnd,
        }
    }

    fn eat(&mut self, expected: char, what: &'static str) -> Result<(), ParseError> {
        if self.peek() == Some(expected) {
            self.bump();
            Ok(())
        } else {
            Err(self.unexpected(what))
        }
    }

    fn ident(&mut self) -> Result<String, ParseError> {
        let start = self.pos;
        match self.peek() {
            Some(c) if c.is_ascii_alphabetic() || c == '_' => {
                self.bump();
            }
            _ => return Err(self.unexpected("identifier")),
        }
        while matches!(self.peek(), Some(c) if c.is_ascii_alphanumeric() || c == '_') {
            self.bump();
        }
        Ok(self.src[start..self.pos].to_string())
    }

    fn call(&mut self) -> Result<CallExpr, ParseError> {
        let name = self.ident()?;
        self.skip_ws();
        self.eat('(', "'('")?;
        let args = if name == TRANSFER_TOOL {
            self.transfer_args()?
        } else {
            self.args()?
        };
        self.eat(')', "')'")?;
        Ok(CallExpr { name, args })
    }

    /// transfer_to_agent 额外接受单个位置字符串：`transfer_to_agent('scientist')`
    fn transfer_args(&mut self) -> Result<Vec<(String, Literal)>, ParseError> {
        self.skip_ws();
        let Some(quote @ ('\'' | '"')) = self.peek() else {
            return self.args();
        };
        let target = self.string(quote)?;
        self.skip_ws();
        if self.peek() == Some(',') {
            self.bump();
            self.skip_ws();
        }
        Ok(vec![(AGENT_NAME_KEY.to_string(), target)])
    }

    fn args(&mut self) -> Result<Vec<(String, Literal)>, ParseError> {
        let mut args = Vec::new();
        self.skip_ws();
        if self.peek() == Some(')') {
            return Ok(args);
        }
        loop {
            args.push(self.kv()?);
            self.skip_ws();
            match self.peek() {
                Some(',') => {
                    self.bump();
                    self.skip_ws();
                    // 允许末尾逗号
                    if self.peek() == Some(')') {
                        break;
                    }
                }
                Some(')') => break,
                _ => return Err(self.unexpected("',' or ')'")),
            }
        }
        Ok(args)
    }

    fn kv(&mut self) -> Result<(String, Literal), ParseError> {
        let key = self.ident()?;
        self.skip_ws();
        self.eat('=', "'='")?;
        self.skip_ws();
        let value = self.literal()?;
        Ok((key, value))
    }

    fn literal(&mut self) -> Result<Literal, ParseError> {
        match self.peek() {
            Some(quote @ ('\'' | '"')) => self.string(quote),
            Some(c) if c == '-' || c.is_ascii_digit() => self.number(),
            Some(c) if c.is_ascii_alphabetic() => {
                let offset = self.pos;
                match self.ident()?.as_str() {
                    "true" | "True" => Ok(Literal::Bool(true)),
                    "false" | "False" => Ok(Literal::Bool(false)),
                    _ => Err(ParseError::Unexpected {
                        offset,
                        found: c,
                        expected: "string, number or boolean",
                    }),
                }
            }
            _ => Err(self.unexpected("string, number or boolean")),
        }
    }

    fn string(&mut self, quote: char) -> Result<Literal, ParseError> {
        self.bump();
        let mut out = String::new();
        loop {
            match self.bump() {
                None => return Err(ParseError::UnexpectedEnd),
                Some(c) if c == quote => return Ok(Literal::Str(out)),
                Some('\\') => match self.bump() {
                    None => return Err(ParseError::UnexpectedEnd),
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some('r') => out.push('\r'),
                    Some(other) => out.push(other),
                },
                Some(c) => out.push(c),
            }
        }
    }

    fn digits(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
            self.bump();
        }
    }

    fn number(&mut self) -> Result<Literal, ParseError> {
        let start = self.pos;
        if self.peek() == Some('-') {
            self.bump();
        }
        self.digits();
        if self.peek() == Some('.') {
            self.bump();
            self.digits();
        }
        if matches!(self.peek(), Some('e' | 'E')) {
            self.bump();
            if matches!(self.peek(), Some('+' | '-')) {
                self.bump();
            }
            self.digits();
        }
        let lexeme = &self.src[start..self.pos];
        if let Ok(i) = lexeme.parse::<i64>() {
            return Ok(Literal::Number(Number::from(i)));
        }
        lexeme
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Literal::Number)
            .ok_or_else(|| ParseError::InvalidNumber(lexeme.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_positional_transfer_target() {
        let call = parse_call("transfer_to_agent( 'scientist' )").unwrap();
        assert_eq!(
            call.args,
            vec![(AGENT_NAME_KEY.to_string(), Literal::Str("scientist".into()))]
        );
        assert_eq!(
            extract_tool_call("```tool_code\ntransfer_to_agent('scientist')\n```"),
            Some(ToolInvocation::transfer("scientist"))
        );
        assert_eq!(
            parse_call(r#"transfer_to_agent("designer",)"#).unwrap().into_invocation(),
            ToolInvocation::transfer("designer")
        );
    }

    #[test]
    fn test_positional_args_only_for_transfer() {
        assert!(parse_call("save_artifact('notes.md')").is_err());
        assert!(parse_call("transfer_to_agent('a', 'b')").is_err());
    }

    #[test]
    fn test_parse_typed_arguments() {
        let call =
            parse_call("transfer_to_agent(agent_name='scientist', count=42, enabled=true)").unwrap();
        assert_eq!(call.name, "transfer_to_agent");
        assert_eq!(
            call.args,
            vec![
                ("agent_name".to_string(), Literal::Str("scientist".into())),
                ("count".to_string(), Literal::Number(Number::from(42))),
                ("enabled".to_string(), Literal::Bool(true)),
            ]
        );
    }

    #[test]
    fn test_transfer_call_normalizes_legacy_key() {
        let invocation = parse_call("transfer_to_agent(agent_name='scientist', count=42, enabled=true)")
            .unwrap()
            .into_invocation();
        assert_eq!(invocation.name, TRANSFER_TOOL);
        assert_eq!(invocation.args.get(AGENT_NAME_KEY), Some(&json!("scientist")));
        assert_eq!(invocation.args.get("count"), Some(&json!(42)));
        assert_eq!(invocation.args.get("enabled"), Some(&json!(true)));
    }

    #[test]
    fn test_escaped_quotes_inside_string() {
        let call = parse_call(r#"say(text='it\'s "fine"', other="a\"b", path='C:\\tmp')"#).unwrap();
        assert_eq!(call.args[0].1, Literal::Str(r#"it's "fine""#.into()));
        assert_eq!(call.args[1].1, Literal::Str(r#"a"b"#.into()));
        assert_eq!(call.args[2].1, Literal::Str(r"C:\tmp".into()));
    }

    #[test]
    fn test_numbers_and_whitespace() {
        let call = parse_call("  f( a = -3 , b=2.5,c=1e3 , )  ").unwrap();
        assert_eq!(call.args[0].1, Literal::Number(Number::from(-3)));
        assert_eq!(call.args[1].1.clone().into_value(), json!(2.5));
        assert_eq!(call.args[2].1.clone().into_value(), json!(1000.0));
    }

    #[test]
    fn test_empty_argument_list() {
        let call = parse_call("list_agents()").unwrap();
        assert!(call.args.is_empty());
    }

    #[test]
    fn test_malformed_inputs_are_errors() {
        assert_eq!(parse_call("f(a='open"), Err(ParseError::UnexpectedEnd));
        assert!(parse_call("f(a=g(1))").is_err());
        assert!(parse_call("f(a=unquoted)").is_err());
        assert!(parse_call("f(a=1) trailing").is_err());
        assert!(parse_call("f(,)").is_err());
        assert!(parse_call("not a call").is_err());
    }

    #[test]
    fn test_first_fenced_block_variants() {
        let tagged = first_fenced_block("prose\n```tool_code\nfoo(a=1)\n```\n```json\n{}\n```").unwrap();
        assert_eq!(tagged.tag, Some("tool_code"));
        assert_eq!(tagged.content, "foo(a=1)");

        let untagged = first_fenced_block("```\nsome_content\n```").unwrap();
        assert_eq!(untagged.tag, None);
        assert_eq!(untagged.content, "some_content");

        let inline = first_fenced_block("```foo(a=1)```").unwrap();
        assert_eq!(inline.content, "foo(a=1)");

        assert!(first_fenced_block("```unterminated").is_none());
        assert!(first_fenced_block("no fences").is_none());
    }

    #[test]
    fn test_extract_tool_call_from_call_syntax_block() {
        let text = "I will delegate.\n```python\ntransfer_to_agent(agent_name='narrative')\n```";
        let call = extract_tool_call(text).unwrap();
        assert_eq!(call.transfer_target(), Some("narrative"));
    }

    #[test]
    fn test_extract_tool_call_from_json_block() {
        let text = "```json\n{\"tool\": \"save_artifact\", \"args\": {\"key\": \"k\"}}\n```";
        let call = extract_tool_call(text).unwrap();
        assert_eq!(call.name, "save_artifact");
        assert_eq!(call.args.get("key"), Some(&json!("k")));

        let openai_style = "```json\n{\"function\": {\"name\": \"f\", \"arguments\": \"{\\\"x\\\": 1}\"}}\n```";
        let call = extract_tool_call(openai_style).unwrap();
        assert_eq!(call.name, "f");
        assert_eq!(call.args.get("x"), Some(&json!(1)));
    }

    #[test]
    fn test_unparseable_block_falls_through() {
        assert!(extract_tool_call("```\nprint('hello world')\n```").is_none());
        assert!(extract_tool_call("```json\n{\"agent_name\": \"scientist\"}\n```").is_none());
        assert!(extract_tool_call("plain prose only").is_none());
    }
}
