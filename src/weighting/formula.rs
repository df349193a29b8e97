//! Formula interpreter: a small stack machine compiled from a formula string
//!
//! The language knows numeric constants, named variables, unary and binary
//! arithmetic (`+ - * / % ^`), function calls, the set-dimension probe
//! `#type` and aggregation loops `<aggfunc, type, initval>{ expr }` folding
//! the features of a type with the aggregate function. Chains that mix
//! operators of different precedence without parentheses are rejected at
//! compile time instead of silently picking an order.
//!
//! Execution uses bounded stacks: 256 values, 16 marks, 16 loop contexts.

use crate::error::{Result, StorageError};
use ahash::AHashMap;

pub type UnaryFunction = fn(f64) -> f64;
pub type BinaryFunction = fn(f64, f64) -> f64;

/// Feature dimension of one type inside the evaluation context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IteratorSpec {
    pub typeidx: i32,
    pub size: u32,
}

/// Evaluation context: resolves type names to feature sets.
pub trait FormulaContext {
    fn iterator_spec(&self, type_name: &str) -> Option<IteratorSpec>;
}

/// Variable accessor: `(ctx, typeidx, idx)`; outside a loop `(-1, 0)`.
pub type VariableFn<C> = fn(&C, i32, u32) -> f64;

const MAX_VALUE_STACK: usize = 256;
const MAX_MARK_STACK: usize = 16;
const MAX_LOOP_STACK: usize = 16;

/// Named variables and functions available to formulas.
pub struct FunctionMap<C> {
    vars: AHashMap<String, VariableFn<C>>,
    unary: AHashMap<String, UnaryFunction>,
    binary: AHashMap<String, BinaryFunction>,
}

impl<C> FunctionMap<C> {
    /// Map with the standard arithmetic and transcendental functions.
    pub fn new() -> Self {
        let mut map = Self {
            vars: AHashMap::new(),
            unary: AHashMap::new(),
            binary: AHashMap::new(),
        };
        map.define_unary("-", |a| -a);
        map.define_unary("log", f64::log10);
        map.define_unary("log10", f64::log10);
        map.define_unary("ln", |a| a.ln());
        map.define_unary("exp", f64::exp);
        map.define_unary("sqrt", f64::sqrt);
        map.define_unary("abs", f64::abs);
        map.define_binary("+", |a, b| a + b);
        map.define_binary("-", |a, b| a - b);
        map.define_binary("*", |a, b| a * b);
        map.define_binary("/", |a, b| a / b);
        map.define_binary("%", |a, b| a % b);
        map.define_binary("^", f64::powf);
        map.define_binary("min", f64::min);
        map.define_binary("max", f64::max);
        map.define_binary("sum", |a, b| a + b);
        map
    }

    pub fn define_variable(&mut self, name: &str, func: VariableFn<C>) {
        self.vars.insert(name.to_ascii_lowercase(), func);
    }

    pub fn define_unary(&mut self, name: &str, func: UnaryFunction) {
        self.unary.insert(name.to_ascii_lowercase(), func);
    }

    pub fn define_binary(&mut self, name: &str, func: BinaryFunction) {
        self.binary.insert(name.to_ascii_lowercase(), func);
    }

    fn variable(&self, name: &str) -> Result<VariableFn<C>> {
        self.vars
            .get(name)
            .copied()
            .ok_or_else(|| StorageError::NotFound(format!("variable '{}' not defined", name)))
    }

    fn unary_function(&self, name: &str) -> Result<UnaryFunction> {
        self.unary
            .get(name)
            .copied()
            .ok_or_else(|| {
                StorageError::NotFound(format!("unary function '{}' not defined", name))
            })
    }

    fn binary_function(&self, name: &str) -> Result<BinaryFunction> {
        self.binary
            .get(name)
            .copied()
            .ok_or_else(|| {
                StorageError::NotFound(format!("binary function '{}' not defined", name))
            })
    }
}

impl<C> Default for FunctionMap<C> {
    fn default() -> Self {
        Self::new()
    }
}

struct VariableRef<C> {
    func: VariableFn<C>,
}

enum Op {
    /// jump target of the innermost loop
    Mark,
    /// enter the feature loop of the named type
    Loop(usize),
    /// next feature or loop exit
    Again,
    PushConst(f64),
    PushVar(usize),
    /// push the dimension of the named type
    PushDim(usize),
    Unary(UnaryFunction),
    Binary(BinaryFunction),
}

/// A compiled formula.
pub struct FormulaInterpreter<C> {
    program: Vec<Op>,
    variables: Vec<VariableRef<C>>,
    strings: Vec<String>,
}

struct Parser<'a, C> {
    src: &'a [u8],
    at: usize,
    map: &'a FunctionMap<C>,
}

impl<'a, C> Parser<'a, C> {
    fn error(&self, msg: &str) -> StorageError {
        let upto = String::from_utf8_lossy(&self.src[..self.at.min(self.src.len())]).into_owned();
        StorageError::InvalidArgument(format!("error in formula: {} (at '{}<-- ! -->')", msg, upto))
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.at).copied()
    }

    fn skip_spaces(&mut self) {
        while self.at < self.src.len() && self.src[self.at] <= 32 {
            self.at += 1;
        }
    }

    fn parse_identifier(&mut self) -> String {
        let start = self.at;
        while self
            .peek()
            .map(|c| c.is_ascii_alphanumeric() || c == b'_')
            .unwrap_or(false)
        {
            self.at += 1;
        }
        let id = String::from_utf8_lossy(&self.src[start..self.at]).to_ascii_lowercase();
        self.skip_spaces();
        id
    }

    fn parse_operator(&mut self) -> String {
        let mut op = String::new();
        if self.peek().map(is_operator).unwrap_or(false) {
            op.push(self.src[self.at] as char);
            self.at += 1;
        }
        self.skip_spaces();
        op
    }

    fn parse_number(&mut self) -> Result<f64> {
        let mut value = 0.0f64;
        let mut sign = false;
        if self.peek() == Some(b'-') {
            sign = true;
            self.at += 1;
        }
        if !self.peek().map(|c| c.is_ascii_digit()).unwrap_or(false) {
            return Err(self.error("number expected"));
        }
        while let Some(c) = self.peek() {
            if !c.is_ascii_digit() {
                break;
            }
            value = value * 10.0 + (c - b'0') as f64;
            self.at += 1;
        }
        if self.peek() == Some(b'.') {
            self.at += 1;
            let mut frac = 1.0;
            while let Some(c) = self.peek() {
                if !c.is_ascii_digit() {
                    break;
                }
                frac /= 10.0;
                value += (c - b'0') as f64 * frac;
                self.at += 1;
            }
        }
        self.skip_spaces();
        Ok(if sign { -value } else { value })
    }
}

fn is_operator(c: u8) -> bool {
    matches!(c, b'*' | b'/' | b'+' | b'-' | b'%' | b'^')
}

fn operator_precedence(op: &str) -> u32 {
    match op {
        "^" => 4,
        "%" => 3,
        "*" | "/" => 2,
        "+" | "-" => 1,
        _ => 0,
    }
}

impl<C> FormulaInterpreter<C> {
    /// Compile `source` against the function map.
    pub fn compile(map: &FunctionMap<C>, source: &str) -> Result<Self> {
        let mut interp = Self {
            program: Vec::new(),
            variables: Vec::new(),
            strings: Vec::new(),
        };
        let mut parser = Parser {
            src: source.as_bytes(),
            at: 0,
            map,
        };
        let exprsize = interp.parse_subexpression(&mut parser, None)?;
        if exprsize > 1 {
            return Err(parser.error("program with more than one return value"));
        }
        if exprsize == 0 {
            return Err(parser.error("program is empty"));
        }
        Ok(interp)
    }

    fn alloc_string(&mut self, name: String) -> usize {
        self.strings.push(name);
        self.strings.len() - 1
    }

    fn push_variable(&mut self, parser: &Parser<'_, C>, name: &str) -> Result<()> {
        let func = parser.map.variable(name)?;
        self.program.push(Op::PushVar(self.variables.len()));
        self.variables.push(VariableRef { func });
        Ok(())
    }

    fn parse_function_call(&mut self, parser: &mut Parser<'_, C>, funcname: &str) -> Result<()> {
        let nofargs = self.parse_subexpression(parser, Some(b')'))?;
        match nofargs {
            0 => self.push_variable(parser, funcname)?,
            1 => {
                let func = parser.map.unary_function(funcname)?;
                self.program.push(Op::Unary(func));
            }
            2 => {
                let func = parser.map.binary_function(funcname)?;
                self.program.push(Op::Binary(func));
            }
            _ => {
                return Err(parser.error(&format!(
                    "too many arguments for function '{}'",
                    funcname
                )))
            }
        }
        Ok(())
    }

    fn parse_operand(&mut self, parser: &mut Parser<'_, C>) -> Result<()> {
        match parser.peek() {
            None => Err(parser.error("unexpected end of expression, operand expected")),
            Some(c) if c.is_ascii_digit() => {
                let num = parser.parse_number()?;
                self.program.push(Op::PushConst(num));
                Ok(())
            }
            Some(b'-') => {
                let mut ahead = parser.at + 1;
                while ahead < parser.src.len() && parser.src[ahead] <= 32 {
                    ahead += 1;
                }
                match parser.src.get(ahead) {
                    Some(&c) if c.is_ascii_alphabetic() || c == b'#' || c == b'<' => {
                        parser.at = ahead;
                        self.parse_operand(parser)?;
                        let func = parser.map.unary_function("-")?;
                        self.program.push(Op::Unary(func));
                        Ok(())
                    }
                    Some(b'(') => {
                        parser.at = ahead + 1;
                        parser.skip_spaces();
                        self.parse_function_call(parser, "-")
                    }
                    Some(c) if c.is_ascii_digit() => {
                        let num = parser.parse_number()?;
                        self.program.push(Op::PushConst(num));
                        Ok(())
                    }
                    _ => Err(parser.error("expression expected after unary '-' operator")),
                }
            }
            Some(b'(') => {
                parser.at += 1;
                parser.skip_spaces();
                let exprsize = self.parse_subexpression(parser, Some(b')'))?;
                if exprsize == 0 {
                    return Err(parser.error("content of operand '(...)' is empty"));
                }
                if exprsize > 1 {
                    return Err(parser.error("content of operand '(...)' has more than one element"));
                }
                Ok(())
            }
            Some(b'#') => {
                parser.at += 1;
                parser.skip_spaces();
                if !parser
                    .peek()
                    .map(|c| c.is_ascii_alphabetic())
                    .unwrap_or(false)
                {
                    return Err(parser.error("identifier expected after dimension operator '#'"));
                }
                let name = parser.parse_identifier();
                let sidx = self.alloc_string(name);
                self.program.push(Op::PushDim(sidx));
                Ok(())
            }
            Some(b'<') => self.parse_loop(parser),
            Some(c) if c.is_ascii_alphabetic() => {
                let name = parser.parse_identifier();
                if parser.peek() == Some(b'(') {
                    parser.at += 1;
                    parser.skip_spaces();
                    self.parse_function_call(parser, &name)
                } else {
                    self.push_variable(parser, &name)
                }
            }
            Some(_) => Err(parser.error(
                "function or variable identifier or numeric operand expected",
            )),
        }
    }

    fn parse_loop(&mut self, parser: &mut Parser<'_, C>) -> Result<()> {
        parser.at += 1;
        parser.skip_spaces();
        let aggregator = match parser.peek() {
            Some(c) if is_operator(c) => parser.parse_operator(),
            Some(c) if c.is_ascii_alphabetic() => parser.parse_identifier(),
            _ => {
                return Err(parser.error("tuple <aggfunc,type> expected in loop predicate"));
            }
        };
        if parser.peek() != Some(b',') {
            return Err(parser.error("tuple <aggfunc,type> expected in loop predicate"));
        }
        parser.at += 1;
        parser.skip_spaces();
        let type_name = parser.parse_identifier();
        let mut initval = 0.0;
        if parser.peek() == Some(b',') {
            parser.at += 1;
            parser.skip_spaces();
            match parser.peek() {
                Some(c) if c == b'-' || c.is_ascii_digit() => {
                    initval = parser.parse_number()?;
                }
                _ => {
                    return Err(parser.error(
                        "number expected as third argument of loop predicate <aggfunc,type,initval>",
                    ))
                }
            }
        }
        if parser.peek() != Some(b'>') {
            return Err(parser.error("closing '>' expected in loop predicate"));
        }
        parser.at += 1;
        parser.skip_spaces();
        if parser.peek() != Some(b'{') {
            return Err(parser.error("open loop bracket '{' expected after loop predicate"));
        }
        parser.at += 1;
        parser.skip_spaces();
        let aggregator_func = parser.map.binary_function(&aggregator)?;

        let sidx = self.alloc_string(type_name);
        self.program.push(Op::Loop(sidx));
        self.program.push(Op::PushConst(initval));
        self.program.push(Op::Mark);

        let loopsize = self.parse_subexpression(parser, Some(b'}'))?;
        if loopsize == 0 {
            return Err(parser.error("content of loop '{...}' is empty"));
        }
        if loopsize > 1 {
            return Err(parser.error("content of loop '{...}' has more than one expression element"));
        }
        self.program.push(Op::Binary(aggregator_func));
        self.program.push(Op::Again);
        Ok(())
    }

    fn parse_subexpression(
        &mut self,
        parser: &mut Parser<'_, C>,
        end_bracket: Option<u8>,
    ) -> Result<u32> {
        let mut nof_elements = 0u32;
        parser.skip_spaces();
        loop {
            match parser.peek() {
                None => break,
                Some(c) if Some(c) == end_bracket => break,
                _ => {}
            }
            self.parse_operand(parser)?;
            nof_elements += 1;
            while parser.peek().map(is_operator).unwrap_or(false) {
                let op = parser.parse_operator();
                self.parse_operand(parser)?;
                if parser.peek().map(is_operator).unwrap_or(false) {
                    let next = (parser.src[parser.at] as char).to_string();
                    if operator_precedence(&op) != operator_precedence(&next) {
                        return Err(parser.error(
                            "mixing operators with different precedence without grouping them with brackets '(' ')'",
                        ));
                    }
                }
                let func = parser.map.binary_function(&op)?;
                self.program.push(Op::Binary(func));
            }
            if parser.peek() == Some(b',') {
                parser.at += 1;
                parser.skip_spaces();
                match parser.peek() {
                    None => return Err(parser.error("unexpected end of expression")),
                    Some(c) if Some(c) == end_bracket => {
                        return Err(parser.error("unexpected end of expression"))
                    }
                    _ => {}
                }
            }
        }
        if let Some(eb) = end_bracket {
            if parser.peek() == Some(eb) {
                parser.at += 1;
                parser.skip_spaces();
            }
        }
        Ok(nof_elements)
    }

    /// Evaluate the program against a context.
    pub fn run(&self, ctx: &C) -> Result<f64>
    where
        C: FormulaContext,
    {
        let mut stack: Vec<f64> = Vec::with_capacity(16);
        let mut marks: Vec<usize> = Vec::with_capacity(4);
        let mut loops: Vec<(IteratorSpec, u32)> = Vec::with_capacity(4);
        let overflow =
            |what: &str| StorageError::ResourceExhausted(format!("{} stack overflow", what));
        let corrupt = |what: &str| StorageError::CorruptData(format!("illegal program: {}", what));

        let mut ip = 0usize;
        while ip < self.program.len() {
            match &self.program[ip] {
                Op::Mark => {
                    if marks.len() >= MAX_MARK_STACK {
                        return Err(overflow("mark"));
                    }
                    marks.push(ip);
                    ip += 1;
                }
                Op::Loop(sidx) => {
                    match ctx.iterator_spec(&self.strings[*sidx]) {
                        Some(spec) if spec.size > 0 => {
                            if loops.len() >= MAX_LOOP_STACK {
                                return Err(overflow("loop"));
                            }
                            loops.push((spec, 0));
                        }
                        _ => {
                            // skip to the matching Again
                            let mut depth = 1;
                            while depth > 0 {
                                ip += 1;
                                match self.program.get(ip) {
                                    Some(Op::Loop(_)) => depth += 1,
                                    Some(Op::Again) => depth -= 1,
                                    Some(_) => {}
                                    None => return Err(corrupt("end of loop not found")),
                                }
                            }
                        }
                    }
                    ip += 1;
                }
                Op::Again => {
                    let Some((spec, itr)) = loops.last_mut() else {
                        return Err(corrupt("loop exit without loop"));
                    };
                    if *itr + 1 < spec.size {
                        *itr += 1;
                        ip = *marks.last().ok_or_else(|| corrupt("loop without mark"))?;
                        ip += 1;
                    } else {
                        loops.pop();
                        marks.pop();
                        ip += 1;
                    }
                }
                Op::PushConst(value) => {
                    if stack.len() >= MAX_VALUE_STACK {
                        return Err(overflow("value"));
                    }
                    stack.push(*value);
                    ip += 1;
                }
                Op::PushVar(vidx) => {
                    if stack.len() >= MAX_VALUE_STACK {
                        return Err(overflow("value"));
                    }
                    let var = &self.variables[*vidx];
                    let value = match loops.last() {
                        Some((spec, itr)) => (var.func)(ctx, spec.typeidx, *itr),
                        None => (var.func)(ctx, -1, 0),
                    };
                    stack.push(value);
                    ip += 1;
                }
                Op::PushDim(sidx) => {
                    if stack.len() >= MAX_VALUE_STACK {
                        return Err(overflow("value"));
                    }
                    let dim = ctx
                        .iterator_spec(&self.strings[*sidx])
                        .map(|s| s.size as f64)
                        .unwrap_or(0.0);
                    stack.push(dim);
                    ip += 1;
                }
                Op::Unary(func) => {
                    let arg = stack.pop().ok_or_else(|| corrupt("pop from empty stack"))?;
                    stack.push(func(arg));
                    ip += 1;
                }
                Op::Binary(func) => {
                    let arg2 = stack.pop().ok_or_else(|| corrupt("pop from empty stack"))?;
                    let arg1 = stack.pop().ok_or_else(|| corrupt("pop from empty stack"))?;
                    stack.push(func(arg1, arg2));
                    ip += 1;
                }
            }
        }
        let result = stack.pop().ok_or_else(|| corrupt("empty result stack"))?;
        if !stack.is_empty() {
            return Err(corrupt(
                "program stack not empty after completion of program run",
            ));
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestCtx {
        ff: Vec<Vec<f64>>,
        types: Vec<&'static str>,
        df: f64,
        n: f64,
    }

    impl FormulaContext for TestCtx {
        fn iterator_spec(&self, type_name: &str) -> Option<IteratorSpec> {
            self.types
                .iter()
                .position(|t| *t == type_name)
                .map(|p| IteratorSpec {
                    typeidx: p as i32,
                    size: self.ff[p].len() as u32,
                })
        }
    }

    fn var_ff(ctx: &TestCtx, typeidx: i32, idx: u32) -> f64 {
        if typeidx < 0 {
            ctx.ff.first().and_then(|f| f.first()).copied().unwrap_or(0.0)
        } else {
            ctx.ff[typeidx as usize][idx as usize]
        }
    }

    fn var_df(ctx: &TestCtx, _typeidx: i32, _idx: u32) -> f64 {
        ctx.df
    }

    fn var_n(ctx: &TestCtx, _typeidx: i32, _idx: u32) -> f64 {
        ctx.n
    }

    fn map() -> FunctionMap<TestCtx> {
        let mut m = FunctionMap::new();
        m.define_variable("ff", var_ff);
        m.define_variable("df", var_df);
        m.define_variable("n", var_n);
        m
    }

    fn ctx() -> TestCtx {
        TestCtx {
            ff: vec![vec![2.0, 1.0, 3.0], vec![4.0]],
            types: vec!["word", "stem"],
            df: 3.0,
            n: 4.0,
        }
    }

    fn eval(src: &str) -> f64 {
        let m = map();
        let interp = FormulaInterpreter::compile(&m, src).unwrap();
        interp.run(&ctx()).unwrap()
    }

    #[test]
    fn constants_and_arithmetic() {
        assert_eq!(eval("1 + 2 + 3"), 6.0);
        assert_eq!(eval("2 * 3 * 4"), 24.0);
        assert_eq!(eval("(1 + 2) * 3"), 9.0);
        assert_eq!(eval("10 / 4"), 2.5);
        assert_eq!(eval("2 ^ 10"), 1024.0);
        assert_eq!(eval("-3.5 * 2"), -7.0);
        assert_eq!(eval("min(3, 7)"), 3.0);
    }

    #[test]
    fn mixed_precedence_rejected() {
        let m = map();
        assert!(FormulaInterpreter::compile(&m, "1 + 2 * 3").is_err());
        assert!(FormulaInterpreter::compile(&m, "1 * 2 + 3").is_err());
        assert!(FormulaInterpreter::compile(&m, "1 + (2 * 3)").is_ok());
        assert!(FormulaInterpreter::compile(&m, "2 ^ 3 * 4").is_err());
    }

    #[test]
    fn variables_outside_loops() {
        assert_eq!(eval("df"), 3.0);
        assert_eq!(eval("df * df"), 9.0);
    }

    #[test]
    fn dimension_probe() {
        assert_eq!(eval("#word"), 3.0);
        assert_eq!(eval("#stem"), 1.0);
        assert_eq!(eval("#unknown"), 0.0);
    }

    #[test]
    fn loops_fold_features() {
        // sum of word ff
        assert_eq!(eval("<+, word>{ ff }"), 6.0);
        // max with init
        assert_eq!(eval("<max, word, -1>{ ff }"), 3.0);
        // loop over undefined type yields the init value
        assert_eq!(eval("<+, unknown, 0>{ ff }"), 0.0);
        // nested arithmetic on loop results requires brackets
        assert_eq!(eval("(<+, word>{ ff }) + (<+, stem>{ ff })"), 10.0);
    }

    #[test]
    fn bm25_style_formula_matches_host_evaluation() {
        let m = map();
        let interp =
            FormulaInterpreter::compile(&m, "log10( (n - (df - 0.5)) / (df + 0.5) ) * ff")
                .unwrap();
        let c = ctx();
        let got = interp.run(&c).unwrap();
        let want = ((4.0_f64 - 3.0 + 0.5) / (3.0 + 0.5)).log10() * 2.0;
        assert!((got - want).abs() < 1e-9, "{} vs {}", got, want);
    }

    #[test]
    fn empty_and_malformed_programs_rejected() {
        let m = map();
        assert!(FormulaInterpreter::compile(&m, "").is_err());
        assert!(FormulaInterpreter::compile(&m, "1 +").is_err());
        assert!(FormulaInterpreter::compile(&m, "nosuchvar").is_err());
        assert!(FormulaInterpreter::compile(&m, "nosuchfn(1)").is_err());
        assert!(FormulaInterpreter::compile(&m, "<+, word>{ }").is_err());
    }

    #[test]
    fn deterministic_across_runs() {
        let m = map();
        let interp = FormulaInterpreter::compile(&m, "<+, word>{ ff / df }").unwrap();
        let c = ctx();
        let a = interp.run(&c).unwrap();
        let b = interp.run(&c).unwrap();
        assert_eq!(a.to_bits(), b.to_bits());
    }
}
