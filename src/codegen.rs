use std::fmt;

use anyhow::{Result, bail};

use crate::ast::{AtomKind, BinaryOp, Expression, Statement, UnaryOp};

/// Branch targets are relative to the branch's own address; this sentinel
/// marks a branch whose target has not been back-patched yet. None may
/// survive emission.
const UNPATCHED: i64 = i64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayRefMode {
    /// Read access: the array must already exist.
    RefOnly,
    /// Assignment access: referencing creates the array if needed.
    CreateAndRef,
}

impl fmt::Display for ArrayRefMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArrayRefMode::RefOnly => write!(f, "refOnly"),
            ArrayRefMode::CreateAndRef => write!(f, "createAndRef"),
        }
    }
}

/// Stack-machine instruction set. Expression evaluation pushes values onto
/// an implicit operand stack; operators and calls consume them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    Concat,
    And,
    Or,
    Dup,
    Negate,
    Incr,
    Decr,
    FetchRetVal,
    Return,
    ReturnNoVal,
    Branch { target: i64 },
    BranchTrue { target: i64 },
    BranchFalse { target: i64 },
    /// Placeholder condition branch for a loop without a condition; the
    /// interpreter never takes it, but it is patched like `BranchFalse`.
    BranchNever { target: i64 },
    Assign { symbol: String },
    PushConst { symbol: String },
    PushSym { symbol: String },
    PushString { string: String },
    PushArraySym { symbol: String, mode: ArrayRefMode },
    ArrayRef { dimensions: usize },
    ArrayAssign { dimensions: usize },
    ArrayDelete { dimensions: usize },
    SubrCall { target: String, args: usize },
}

impl Instruction {
    pub fn mnemonic(&self) -> &'static str {
        match self {
            Instruction::Add => "ADD",
            Instruction::Sub => "SUB",
            Instruction::Mul => "MUL",
            Instruction::Div => "DIV",
            Instruction::Mod => "MOD",
            Instruction::Eq => "EQ",
            Instruction::Ne => "NE",
            Instruction::Lt => "LT",
            Instruction::Gt => "GT",
            Instruction::Le => "LE",
            Instruction::Ge => "GE",
            Instruction::Concat => "CONCAT",
            Instruction::And => "AND",
            Instruction::Or => "OR",
            Instruction::Dup => "DUP",
            Instruction::Negate => "NEGATE",
            Instruction::Incr => "INCR",
            Instruction::Decr => "DECR",
            Instruction::FetchRetVal => "FETCH_RET_VAL",
            Instruction::Return => "RETURN",
            Instruction::ReturnNoVal => "RETURN_NO_VAL",
            Instruction::Branch { .. } => "BRANCH",
            Instruction::BranchTrue { .. } => "BRANCH_TRUE",
            Instruction::BranchFalse { .. } => "BRANCH_FALSE",
            Instruction::BranchNever { .. } => "BRANCH_NEVER",
            Instruction::Assign { .. } => "ASSIGN",
            Instruction::PushConst { .. } | Instruction::PushSym { .. } | Instruction::PushString { .. } => {
                "PUSH_SYM"
            }
            Instruction::PushArraySym { .. } => "PUSH_ARRAY_SYM",
            Instruction::ArrayRef { .. } => "ARRAY_REF",
            Instruction::ArrayAssign { .. } => "ARRAY_ASSIGN",
            Instruction::ArrayDelete { .. } => "ARRAY_DELETE",
            Instruction::SubrCall { .. } => "SUBR_CALL",
        }
    }

    /// The relative displacement carried by a branch, `None` for everything
    /// else.
    pub fn branch_target(&self) -> Option<i64> {
        match self {
            Instruction::Branch { target }
            | Instruction::BranchTrue { target }
            | Instruction::BranchFalse { target }
            | Instruction::BranchNever { target } => Some(*target),
            _ => None,
        }
    }
}

/// The finished instruction stream. An instruction's address is its index.
#[derive(Debug, Clone, PartialEq)]
pub struct IrProgram {
    nodes: Vec<Instruction>,
}

impl IrProgram {
    pub fn nodes(&self) -> &[Instruction] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl fmt::Display for IrProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (address, instruction) in self.nodes.iter().enumerate() {
            write_instruction(f, address, instruction)?;
        }
        Ok(())
    }
}

fn write_instruction(
    f: &mut fmt::Formatter<'_>,
    address: usize,
    instruction: &Instruction,
) -> fmt::Result {
    match instruction {
        Instruction::Branch { target }
        | Instruction::BranchTrue { target }
        | Instruction::BranchFalse { target }
        | Instruction::BranchNever { target } => {
            writeln!(f, "{:<16} {} to=({:+})", address, instruction.mnemonic(), target)
        }
        Instruction::Assign { symbol } => writeln!(f, "{address:<16} ASSIGN {symbol}"),
        Instruction::PushConst { symbol } => writeln!(f, "{address:<16} PUSH_SYM const {symbol}"),
        Instruction::PushSym { symbol } => writeln!(f, "{address:<16} PUSH_SYM {symbol}"),
        Instruction::PushString { string } => {
            let body: String = string.chars().take(20).collect();
            writeln!(
                f,
                "{address:<16} PUSH_SYM string <{}> \"{}\"...",
                string.chars().count(),
                escape_string(&body),
            )
        }
        Instruction::PushArraySym { symbol, mode } => {
            writeln!(f, "{address:<16} PUSH_ARRAY_SYM {symbol} {mode}")
        }
        Instruction::ArrayRef { dimensions }
        | Instruction::ArrayAssign { dimensions }
        | Instruction::ArrayDelete { dimensions } => {
            writeln!(f, "{:<16} {} nDim={}", address, instruction.mnemonic(), dimensions)
        }
        Instruction::SubrCall { target, args } => {
            writeln!(f, "{address:<16} SUBR_CALL {target} ({args} arg)")
        }
        plain => writeln!(f, "{:<16} {}", address, plain.mnemonic()),
    }
}

fn escape_string(s: &str) -> String {
    let mut escaped = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '\n' => escaped.push_str("\\n"),
            '\t' => escaped.push_str("\\t"),
            '"' => escaped.push_str("\\\""),
            _ => escaped.push(ch),
        }
    }
    escaped
}

#[derive(Default)]
struct LoopContext {
    breaks: Vec<usize>,
    continues: Vec<usize>,
}

pub struct CodeGenerator {
    nodes: Vec<Instruction>,
    loop_stack: Vec<LoopContext>,
    /// Depth of nested binary-expression emission. Side-effectful
    /// sub-expressions leave their value on the stack (`DUP`,
    /// `FETCH_RET_VAL`) only when this is non-zero; in statement position
    /// the value is not wanted.
    binary_depth: u32,
}

impl CodeGenerator {
    fn new() -> Self {
        Self {
            nodes: Vec::new(),
            loop_stack: Vec::new(),
            binary_depth: 0,
        }
    }

    fn current_location(&self) -> i64 {
        self.nodes.len() as i64
    }

    /// Appends an instruction and returns its address for later patching.
    fn emit(&mut self, instruction: Instruction) -> usize {
        let address = self.nodes.len();
        self.nodes.push(instruction);
        address
    }

    fn emit_when(&mut self, enabled: bool, instruction: Instruction) {
        if enabled {
            self.emit(instruction);
        }
    }

    fn patch_branch(&mut self, index: usize, target: i64) {
        match &mut self.nodes[index] {
            Instruction::Branch { target: slot }
            | Instruction::BranchTrue { target: slot }
            | Instruction::BranchFalse { target: slot }
            | Instruction::BranchNever { target: slot } => *slot = target,
            other => unreachable!("patched a non-branch instruction {other:?}"),
        }
    }

    fn patch_branch_to_here(&mut self, index: usize) {
        let target = self.current_location() - index as i64;
        self.patch_branch(index, target);
    }

    fn emit_statements(&mut self, statements: &[Statement]) -> Result<()> {
        for statement in statements {
            self.emit_statement(statement)?;
        }
        Ok(())
    }

    fn emit_statement(&mut self, statement: &Statement) -> Result<()> {
        match statement {
            Statement::Block(statements) => self.emit_statements(statements)?,
            Statement::Expression(Some(expression)) => self.emit_expression(expression)?,
            Statement::Expression(None) => {}
            Statement::If { cond, then_body, else_body } => {
                self.emit_expression(cond)?;
                let skip_then = self.emit(Instruction::BranchFalse { target: UNPATCHED });

                self.emit_statement(then_body)?;

                match else_body {
                    Some(else_body) => {
                        let skip_else = self.emit(Instruction::Branch { target: UNPATCHED });
                        self.patch_branch_to_here(skip_then);
                        self.emit_statement(else_body)?;
                        self.patch_branch_to_here(skip_else);
                    }
                    None => self.patch_branch_to_here(skip_then),
                }
            }
            Statement::Loop { init, cond, incr, body } => self.emit_loop(init, cond.as_ref(), incr, body)?,
            Statement::ForEach { .. } => {
                bail!("for ... in loops are not supported by the code generator")
            }
            Statement::Function { name, .. } => {
                bail!("subroutine '{name}' cannot be lowered into the instruction stream")
            }
            Statement::Delete { target, indices } => {
                self.emit_array_base(target)?;
                for index in indices {
                    self.emit_expression(index)?;
                }
                self.emit(Instruction::ArrayDelete { dimensions: indices.len() });
            }
            Statement::Return { value: Some(value) } => {
                self.emit_expression(value)?;
                self.emit(Instruction::Return);
            }
            Statement::Return { value: None } => {
                self.emit(Instruction::ReturnNoVal);
            }
            Statement::Break => {
                if self.loop_stack.is_empty() {
                    bail!("break statement outside of a loop");
                }
                let branch = self.emit(Instruction::Branch { target: UNPATCHED });
                if let Some(frame) = self.loop_stack.last_mut() {
                    frame.breaks.push(branch);
                }
            }
            Statement::Continue => {
                if self.loop_stack.is_empty() {
                    bail!("continue statement outside of a loop");
                }
                let branch = self.emit(Instruction::Branch { target: UNPATCHED });
                if let Some(frame) = self.loop_stack.last_mut() {
                    frame.continues.push(branch);
                }
            }
        }
        Ok(())
    }

    fn emit_loop(
        &mut self,
        init: &[Expression],
        cond: Option<&Expression>,
        incr: &[Expression],
        body: &Statement,
    ) -> Result<()> {
        self.loop_stack.push(LoopContext::default());

        for expression in init {
            self.emit_expression(expression)?;
        }

        let loop_start = self.current_location();

        let cond_branch = match cond {
            Some(cond) => {
                self.emit_expression(cond)?;
                self.emit(Instruction::BranchFalse { target: UNPATCHED })
            }
            None => self.emit(Instruction::BranchNever { target: UNPATCHED }),
        };

        self.emit_statement(body)?;

        let loop_incr = self.current_location();
        for expression in incr {
            self.emit_expression(expression)?;
        }

        let loop_end = self.current_location();
        self.emit(Instruction::Branch { target: loop_start - loop_end });

        // the exit lands just past the back-edge
        self.patch_branch(cond_branch, loop_end - cond_branch as i64 + 1);

        if let Some(frame) = self.loop_stack.pop() {
            for branch in frame.breaks {
                self.patch_branch(branch, loop_end + 1 - branch as i64);
            }
            for branch in frame.continues {
                self.patch_branch(branch, loop_incr - branch as i64);
            }
        }

        Ok(())
    }

    fn emit_expression(&mut self, expression: &Expression) -> Result<()> {
        match expression {
            Expression::Atom { value, kind } => {
                match kind {
                    AtomKind::Integer => self.emit(Instruction::PushConst { symbol: value.clone() }),
                    AtomKind::String => self.emit(Instruction::PushString { string: value.clone() }),
                    AtomKind::Identifier => self.emit(Instruction::PushSym { symbol: value.clone() }),
                    AtomKind::ArrayIdentifier => self.emit(Instruction::PushArraySym {
                        symbol: value.clone(),
                        mode: ArrayRefMode::RefOnly,
                    }),
                };
                Ok(())
            }
            Expression::Binary { op, lhs, rhs } => {
                self.binary_depth += 1;
                let result = self.emit_binary(*op, lhs, rhs);
                self.binary_depth -= 1;
                result
            }
            Expression::Unary { op, operand, prefix } => match op {
                UnaryOp::Sub => {
                    self.emit_expression(operand)?;
                    self.emit(Instruction::Negate);
                    Ok(())
                }
                UnaryOp::Not => bail!("logical not is not supported by the code generator"),
                UnaryOp::Increment => {
                    self.emit_increment_decrement(Instruction::Incr, operand, *prefix)
                }
                UnaryOp::Decrement => {
                    self.emit_increment_decrement(Instruction::Decr, operand, *prefix)
                }
            },
            Expression::Call { callee, args } => {
                for arg in args {
                    self.emit_expression(arg)?;
                }
                self.emit(Instruction::SubrCall {
                    target: symbol_name(callee)?,
                    args: args.len(),
                });
                // a call in value position must surface its return value
                self.emit_when(self.binary_depth > 0, Instruction::FetchRetVal);
                Ok(())
            }
            Expression::ArrayIndex { array, indices } => {
                self.emit_array_base(array)?;
                for index in indices {
                    self.emit_expression(index)?;
                }
                self.emit(Instruction::ArrayRef { dimensions: indices.len() });
                Ok(())
            }
        }
    }

    fn emit_binary(&mut self, op: BinaryOp, lhs: &Expression, rhs: &Expression) -> Result<()> {
        match op {
            BinaryOp::Assign => self.emit_assignment(lhs, rhs),
            BinaryOp::AddAssign
            | BinaryOp::SubAssign
            | BinaryOp::MulAssign
            | BinaryOp::DivAssign
            | BinaryOp::ModAssign => {
                // x op= y lowers as x = x op y
                let value = Expression::Binary {
                    op: compound_operation(op),
                    lhs: Box::new(lhs.clone()),
                    rhs: Box::new(rhs.clone()),
                };
                self.emit_assignment(lhs, &value)
            }
            BinaryOp::Add
            | BinaryOp::Sub
            | BinaryOp::Mul
            | BinaryOp::Div
            | BinaryOp::Mod
            | BinaryOp::Equal
            | BinaryOp::NotEqual
            | BinaryOp::LessThan
            | BinaryOp::LessThanOrEqual
            | BinaryOp::GreaterThan
            | BinaryOp::GreaterThanOrEqual
            | BinaryOp::BinaryAnd
            | BinaryOp::BinaryOr => {
                self.emit_expression(lhs)?;
                self.emit_expression(rhs)?;
                self.emit(simple_opcode(op));
                Ok(())
            }
            BinaryOp::Concatenate => {
                self.emit_expression(lhs)?;

                // flatten a right-leaning chain into one linear run
                let mut tail = rhs;
                while let Expression::Binary {
                    op: BinaryOp::Concatenate,
                    lhs: chain_lhs,
                    rhs: chain_rhs,
                } = tail
                {
                    self.emit_expression(chain_lhs)?;
                    self.emit(Instruction::Concat);
                    tail = chain_rhs;
                }

                self.emit_expression(tail)?;
                self.emit(Instruction::Concat);
                Ok(())
            }
            BinaryOp::LogicalAnd => self.emit_short_circuit(
                lhs,
                rhs,
                BinaryOp::LogicalAnd,
                Instruction::And,
                |target| Instruction::BranchFalse { target },
            ),
            BinaryOp::LogicalOr => self.emit_short_circuit(
                lhs,
                rhs,
                BinaryOp::LogicalOr,
                Instruction::Or,
                |target| Instruction::BranchTrue { target },
            ),
            BinaryOp::In => {
                bail!("'in' is only supported in the head of a for loop")
            }
            BinaryOp::Exponent => {
                bail!("exponentiation of non-constant operands is not supported by the code generator")
            }
        }
    }

    /// Short-circuit emission: after every operand the intermediate result
    /// is duplicated and a branch skips the rest of the chain, so the stack
    /// holds exactly one value on both the taken and not-taken paths. A
    /// right-leaning chain of the same operator is flattened into a linear
    /// run of branches to the common end.
    fn emit_short_circuit(
        &mut self,
        lhs: &Expression,
        rhs: &Expression,
        chain_op: BinaryOp,
        combine: Instruction,
        branch: fn(i64) -> Instruction,
    ) -> Result<()> {
        self.emit_expression(lhs)?;
        self.emit(Instruction::Dup);
        let mut pending = self.emit(branch(UNPATCHED));

        let mut tail = rhs;
        while let Expression::Binary { op, lhs: chain_lhs, rhs: chain_rhs } = tail {
            if *op != chain_op {
                break;
            }
            self.emit_expression(chain_lhs)?;
            self.emit(combine.clone());
            self.patch_branch_to_here(pending);
            self.emit(Instruction::Dup);
            pending = self.emit(branch(UNPATCHED));
            tail = chain_rhs;
        }

        self.emit_expression(tail)?;
        self.emit(combine);
        self.patch_branch_to_here(pending);
        Ok(())
    }

    fn emit_assignment(&mut self, target: &Expression, value: &Expression) -> Result<()> {
        if let Expression::ArrayIndex { array, indices } = target {
            self.emit(Instruction::PushArraySym {
                symbol: symbol_name(array)?,
                mode: ArrayRefMode::CreateAndRef,
            });
            for index in indices {
                self.emit_expression(index)?;
            }
            self.emit_expression(value)?;
            self.emit(Instruction::ArrayAssign { dimensions: indices.len() });
        } else {
            self.emit_expression(value)?;
            self.emit(Instruction::Assign { symbol: symbol_name(target)? });
        }
        Ok(())
    }

    /// `++`/`--` write their operand back after stepping it. For array
    /// elements the index list is emitted twice: once for the assignment
    /// reference and once for the element read.
    fn emit_increment_decrement(
        &mut self,
        step: Instruction,
        operand: &Expression,
        prefix: bool,
    ) -> Result<()> {
        let keep_value = self.binary_depth > 0;

        if let Expression::ArrayIndex { array, indices } = operand {
            let symbol = symbol_name(array)?;
            self.emit(Instruction::PushArraySym {
                symbol: symbol.clone(),
                mode: ArrayRefMode::CreateAndRef,
            });
            for index in indices {
                self.emit_expression(index)?;
            }
            self.emit(Instruction::PushArraySym {
                symbol,
                mode: ArrayRefMode::RefOnly,
            });
            for index in indices {
                self.emit_expression(index)?;
            }
            self.emit(Instruction::ArrayRef { dimensions: indices.len() });

            if prefix {
                self.emit_when(keep_value, Instruction::Dup);
                self.emit(step);
            } else {
                self.emit(step);
                self.emit_when(keep_value, Instruction::Dup);
            }

            self.emit(Instruction::ArrayAssign { dimensions: indices.len() });
            return Ok(());
        }

        self.emit_expression(operand)?;
        if prefix {
            self.emit_when(keep_value, Instruction::Dup);
            self.emit(step);
        } else {
            self.emit(step);
            self.emit_when(keep_value, Instruction::Dup);
        }
        self.emit(Instruction::Assign { symbol: symbol_name(operand)? });
        Ok(())
    }

    /// An identifier at the base of an index chain names an array, so it is
    /// pushed as an array reference rather than a scalar read.
    fn emit_array_base(&mut self, array: &Expression) -> Result<()> {
        if let Expression::Atom { value, kind: AtomKind::Identifier } = array {
            self.emit(Instruction::PushArraySym {
                symbol: value.clone(),
                mode: ArrayRefMode::RefOnly,
            });
            return Ok(());
        }
        self.emit_expression(array)
    }

    fn finish(self) -> Result<IrProgram> {
        for (address, instruction) in self.nodes.iter().enumerate() {
            if instruction.branch_target() == Some(UNPATCHED) {
                bail!("branch at address {address} was never patched");
            }
        }
        Ok(IrProgram { nodes: self.nodes })
    }
}

fn symbol_name(expression: &Expression) -> Result<String> {
    match expression {
        Expression::Atom { value, .. } => Ok(value.clone()),
        other => bail!("expected an identifier, found {other:?}"),
    }
}

fn compound_operation(op: BinaryOp) -> BinaryOp {
    match op {
        BinaryOp::AddAssign => BinaryOp::Add,
        BinaryOp::SubAssign => BinaryOp::Sub,
        BinaryOp::MulAssign => BinaryOp::Mul,
        BinaryOp::DivAssign => BinaryOp::Div,
        BinaryOp::ModAssign => BinaryOp::Mod,
        other => unreachable!("{other:?} is not a compound assignment"),
    }
}

fn simple_opcode(op: BinaryOp) -> Instruction {
    match op {
        BinaryOp::Add => Instruction::Add,
        BinaryOp::Sub => Instruction::Sub,
        BinaryOp::Mul => Instruction::Mul,
        BinaryOp::Div => Instruction::Div,
        BinaryOp::Mod => Instruction::Mod,
        BinaryOp::Equal => Instruction::Eq,
        BinaryOp::NotEqual => Instruction::Ne,
        BinaryOp::LessThan => Instruction::Lt,
        BinaryOp::GreaterThan => Instruction::Gt,
        BinaryOp::LessThanOrEqual => Instruction::Le,
        BinaryOp::GreaterThanOrEqual => Instruction::Ge,
        BinaryOp::BinaryAnd => Instruction::And,
        BinaryOp::BinaryOr => Instruction::Or,
        other => unreachable!("{other:?} has no single-opcode lowering"),
    }
}

/// Lowers the optimized statement list into the flat instruction stream,
/// appending the final `RETURN_NO_VAL` that ends every program.
pub fn generate(statements: &[Statement]) -> Result<IrProgram> {
    let mut generator = CodeGenerator::new();
    generator.emit_statements(statements)?;
    generator.emit(Instruction::ReturnNoVal);
    generator.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::tokenize;
    use crate::optimizer::{fold_constant_expressions, prune_empty_statements};
    use crate::parser::{Parser, parse_tokens};

    /// Full pipeline: lex, parse, prune, fold, generate.
    fn lower(source: &str) -> IrProgram {
        let tokens = tokenize(source.as_bytes()).expect("tokenize should succeed");
        let mut program = parse_tokens(tokens).expect("parse should succeed");
        prune_empty_statements(&mut program.statements);
        fold_constant_expressions(&mut program.statements);
        generate(&program.statements).expect("generate should succeed")
    }

    fn lower_error(source: &str) -> String {
        let tokens = tokenize(source.as_bytes()).expect("tokenize should succeed");
        let program = parse_tokens(tokens).expect("parse should succeed");
        generate(&program.statements)
            .expect_err("generate should fail")
            .to_string()
    }

    /// Lowers a bare expression without the optimizer, for shapes the
    /// statement dispatch cannot produce.
    fn lower_expression(source: &str) -> IrProgram {
        let tokens = tokenize(source.as_bytes()).expect("tokenize should succeed");
        let mut parser = Parser::new(tokens);
        let expression = parser
            .parse_expression()
            .expect("parse should succeed")
            .expect("expected an expression");
        generate(&[Statement::Expression(Some(expression))]).expect("generate should succeed")
    }

    fn push_const(symbol: &str) -> Instruction {
        Instruction::PushConst { symbol: symbol.to_string() }
    }

    fn push_sym(symbol: &str) -> Instruction {
        Instruction::PushSym { symbol: symbol.to_string() }
    }

    fn push_string(string: &str) -> Instruction {
        Instruction::PushString { string: string.to_string() }
    }

    fn push_array(symbol: &str, mode: ArrayRefMode) -> Instruction {
        Instruction::PushArraySym { symbol: symbol.to_string(), mode }
    }

    fn assign(symbol: &str) -> Instruction {
        Instruction::Assign { symbol: symbol.to_string() }
    }

    #[test]
    fn folded_assignment_lowers_to_three_instructions() {
        let ir = lower("x = 1 + 2\n");
        assert_eq!(
            ir.nodes(),
            &[push_const("3"), assign("x"), Instruction::ReturnNoVal]
        );
    }

    #[test]
    fn implicit_concatenation_lowers_left_to_right() {
        let ir = lower_expression("\"a\" \"b\" \"c\"");
        assert_eq!(
            ir.nodes(),
            &[
                push_string("a"),
                push_string("b"),
                Instruction::Concat,
                push_string("c"),
                Instruction::Concat,
                Instruction::ReturnNoVal,
            ]
        );
    }

    #[test]
    fn folding_collapses_a_string_chain_to_one_push() {
        let ir = lower("x = \"a\" \"b\" \"c\"\n");
        assert_eq!(
            ir.nodes(),
            &[push_string("abc"), assign("x"), Instruction::ReturnNoVal]
        );
    }

    #[test]
    fn if_else_branches_over_both_arms() {
        let ir = lower("if (a > 0)\n b = 1\nelse\n b = 2\n");
        assert_eq!(
            ir.nodes(),
            &[
                push_sym("a"),
                push_const("0"),
                Instruction::Gt,
                Instruction::BranchFalse { target: 4 },
                push_const("1"),
                assign("b"),
                Instruction::Branch { target: 3 },
                push_const("2"),
                assign("b"),
                Instruction::ReturnNoVal,
            ]
        );
    }

    #[test]
    fn if_without_else_branches_past_the_body() {
        let ir = lower("if (a)\n b = 1\n");
        assert_eq!(
            ir.nodes(),
            &[
                push_sym("a"),
                Instruction::BranchFalse { target: 3 },
                push_const("1"),
                assign("b"),
                Instruction::ReturnNoVal,
            ]
        );
    }

    #[test]
    fn c_style_for_loops_back_with_a_negative_offset() {
        let ir = lower("for (i = 0; i < 3; i++)\n s = s i\n");
        assert_eq!(
            ir.nodes(),
            &[
                push_const("0"),
                assign("i"),
                push_sym("i"),
                push_const("3"),
                Instruction::Lt,
                Instruction::BranchFalse { target: 9 },
                push_sym("s"),
                push_sym("i"),
                Instruction::Concat,
                assign("s"),
                push_sym("i"),
                Instruction::Incr,
                assign("i"),
                Instruction::Branch { target: -11 },
                Instruction::ReturnNoVal,
            ]
        );
    }

    #[test]
    fn condition_free_for_emits_branch_never() {
        let ir = lower("for (;;)\n break\n");
        assert_eq!(
            ir.nodes(),
            &[
                Instruction::BranchNever { target: 3 },
                Instruction::Branch { target: 2 },
                Instruction::Branch { target: -2 },
                Instruction::ReturnNoVal,
            ]
        );
    }

    #[test]
    fn break_and_continue_patch_against_their_loop() {
        let source = "while (x < 3) {\n if (y)\n  continue\n break\n}\n";
        let ir = lower(source);
        assert_eq!(
            ir.nodes(),
            &[
                push_sym("x"),
                push_const("3"),
                Instruction::Lt,
                Instruction::BranchFalse { target: 6 },
                push_sym("y"),
                Instruction::BranchFalse { target: 2 },
                Instruction::Branch { target: 2 }, // continue -> loop increment slot
                Instruction::Branch { target: 2 }, // break -> past the back-edge
                Instruction::Branch { target: -8 },
                Instruction::ReturnNoVal,
            ]
        );
    }

    #[test]
    fn logical_and_chains_short_circuit_to_a_common_end() {
        let ir = lower_expression("a && b && c");
        let expected = [
            push_sym("a"),
            Instruction::Dup,
            Instruction::BranchFalse { target: 3 },
            push_sym("b"),
            Instruction::And,
            Instruction::Dup,
            Instruction::BranchFalse { target: 3 },
            push_sym("c"),
            Instruction::And,
            Instruction::ReturnNoVal,
        ];
        assert_eq!(ir.nodes(), &expected);

        // a parenthesized right-leaning chain flattens to the same run
        let ir = lower_expression("a && (b && c)");
        assert_eq!(ir.nodes(), &expected);
    }

    #[test]
    fn logical_or_short_circuits_on_true() {
        let ir = lower_expression("a || b");
        assert_eq!(
            ir.nodes(),
            &[
                push_sym("a"),
                Instruction::Dup,
                Instruction::BranchTrue { target: 3 },
                push_sym("b"),
                Instruction::Or,
                Instruction::ReturnNoVal,
            ]
        );
    }

    #[test]
    fn bitwise_operators_use_the_plain_opcodes() {
        let ir = lower("x = a & b\n");
        assert_eq!(
            ir.nodes(),
            &[push_sym("a"), push_sym("b"), Instruction::And, assign("x"), Instruction::ReturnNoVal]
        );

        let ir = lower("x = a | b\n");
        assert_eq!(
            ir.nodes(),
            &[push_sym("a"), push_sym("b"), Instruction::Or, assign("x"), Instruction::ReturnNoVal]
        );
    }

    #[test]
    fn calls_fetch_their_return_value_only_in_value_position() {
        let ir = lower("f(1)\n");
        assert_eq!(
            ir.nodes(),
            &[
                push_const("1"),
                Instruction::SubrCall { target: "f".to_string(), args: 1 },
                Instruction::ReturnNoVal,
            ]
        );

        let ir = lower("x = f()\n");
        assert_eq!(
            ir.nodes(),
            &[
                Instruction::SubrCall { target: "f".to_string(), args: 0 },
                Instruction::FetchRetVal,
                assign("x"),
                Instruction::ReturnNoVal,
            ]
        );
    }

    #[test]
    fn increment_duplicates_only_in_value_position() {
        let ir = lower("i++\n");
        assert_eq!(
            ir.nodes(),
            &[push_sym("i"), Instruction::Incr, assign("i"), Instruction::ReturnNoVal]
        );

        let ir = lower("x = i++\n");
        assert_eq!(
            ir.nodes(),
            &[
                push_sym("i"),
                Instruction::Incr,
                Instruction::Dup,
                assign("i"),
                assign("x"),
                Instruction::ReturnNoVal,
            ]
        );

        let ir = lower("x = --i\n");
        assert_eq!(
            ir.nodes(),
            &[
                push_sym("i"),
                Instruction::Dup,
                Instruction::Decr,
                assign("i"),
                assign("x"),
                Instruction::ReturnNoVal,
            ]
        );
    }

    #[test]
    fn array_element_increment_duplicates_its_indices() {
        let ir = lower("arr[i]++\n");
        assert_eq!(
            ir.nodes(),
            &[
                push_array("arr", ArrayRefMode::CreateAndRef),
                push_sym("i"),
                push_array("arr", ArrayRefMode::RefOnly),
                push_sym("i"),
                Instruction::ArrayRef { dimensions: 1 },
                Instruction::Incr,
                Instruction::ArrayAssign { dimensions: 1 },
                Instruction::ReturnNoVal,
            ]
        );
    }

    #[test]
    fn array_assignment_references_then_stores() {
        let ir = lower("arr[1, 2] = 5\n");
        assert_eq!(
            ir.nodes(),
            &[
                push_array("arr", ArrayRefMode::CreateAndRef),
                push_const("1"),
                push_const("2"),
                push_const("5"),
                Instruction::ArrayAssign { dimensions: 2 },
                Instruction::ReturnNoVal,
            ]
        );
    }

    #[test]
    fn array_reads_push_an_array_reference() {
        let ir = lower("x = arr[k]\n");
        assert_eq!(
            ir.nodes(),
            &[
                push_array("arr", ArrayRefMode::RefOnly),
                push_sym("k"),
                Instruction::ArrayRef { dimensions: 1 },
                assign("x"),
                Instruction::ReturnNoVal,
            ]
        );
    }

    #[test]
    fn delete_lowers_like_an_indexed_reference() {
        let ir = lower("delete arr[k]\n");
        assert_eq!(
            ir.nodes(),
            &[
                push_array("arr", ArrayRefMode::RefOnly),
                push_sym("k"),
                Instruction::ArrayDelete { dimensions: 1 },
                Instruction::ReturnNoVal,
            ]
        );
    }

    #[test]
    fn compound_assignment_desugars_to_a_plain_store() {
        let ir = lower("x += 2\n");
        assert_eq!(
            ir.nodes(),
            &[
                push_sym("x"),
                push_const("2"),
                Instruction::Add,
                assign("x"),
                Instruction::ReturnNoVal,
            ]
        );

        let ir = lower("arr[i] *= 2\n");
        assert_eq!(
            ir.nodes(),
            &[
                push_array("arr", ArrayRefMode::CreateAndRef),
                push_sym("i"),
                push_array("arr", ArrayRefMode::RefOnly),
                push_sym("i"),
                Instruction::ArrayRef { dimensions: 1 },
                push_const("2"),
                Instruction::Mul,
                Instruction::ArrayAssign { dimensions: 1 },
                Instruction::ReturnNoVal,
            ]
        );
    }

    #[test]
    fn return_with_and_without_a_value() {
        let ir = lower("return x\n");
        assert_eq!(
            ir.nodes(),
            &[push_sym("x"), Instruction::Return, Instruction::ReturnNoVal]
        );

        let ir = lower("return\n");
        assert_eq!(
            ir.nodes(),
            &[Instruction::ReturnNoVal, Instruction::ReturnNoVal]
        );
    }

    #[test]
    fn negation_emits_negate() {
        let ir = lower("x = -y\n");
        assert_eq!(
            ir.nodes(),
            &[push_sym("y"), Instruction::Negate, assign("x"), Instruction::ReturnNoVal]
        );
    }

    #[test]
    fn unsupported_constructs_fail_cleanly() {
        assert!(lower_error("break\n").contains("outside of a loop"));
        assert!(lower_error("continue\n").contains("outside of a loop"));
        assert!(lower_error("for (x in arr)\n y = x\n").contains("not supported"));
        assert!(lower_error("define f {\n}\n").contains("cannot be lowered"));
        assert!(lower_error("x = !y\n").contains("not supported"));
        assert!(lower_error("x = a ^ b\n").contains("not supported"));
        assert!(lower_error("x = a in b\n").contains("for loop"));
    }

    #[test]
    fn every_branch_is_patched_and_lands_in_bounds() {
        let source = "s = \"\"\nfor (i = 0; i < 10; i++) {\n if (i % 2)\n  continue\n else\n  s = s i\n if (i > 8)\n  break\n}\n";
        let ir = lower(source);
        let len = ir.len() as i64;
        for (address, instruction) in ir.nodes().iter().enumerate() {
            if let Some(target) = instruction.branch_target() {
                assert_ne!(target, i64::MAX, "unpatched branch at {address}");
                let destination = address as i64 + target;
                assert!(
                    (0..=len).contains(&destination),
                    "branch at {address} lands at {destination}, outside 0..={len}"
                );
            }
        }
    }

    #[test]
    fn loop_condition_branch_exits_past_the_back_edge() {
        let ir = lower("while (x)\n y = 1\n");
        // BRANCH_FALSE sits at address 1, the back-edge at 4
        assert_eq!(
            ir.nodes()[1],
            Instruction::BranchFalse { target: 4 }
        );
        assert_eq!(ir.nodes()[4], Instruction::Branch { target: -4 });
    }

    #[test]
    fn renders_the_documented_text_format() {
        let ir = lower("x = 1 + 2\n");
        assert_eq!(
            ir.to_string(),
            "0                PUSH_SYM const 3\n\
             1                ASSIGN x\n\
             2                RETURN_NO_VAL\n"
        );
    }

    #[test]
    fn renders_branches_with_signed_offsets() {
        let ir = lower("while (x)\n y = 1\n");
        let rendered = ir.to_string();
        assert!(rendered.contains("BRANCH_FALSE to=(+4)"), "got:\n{rendered}");
        assert!(rendered.contains("BRANCH to=(-4)"), "got:\n{rendered}");
    }

    #[test]
    fn renders_strings_escaped_and_truncated() {
        let ir = lower("s = \"hi\\tthere\"\n");
        let rendered = ir.to_string();
        assert!(
            rendered.contains("PUSH_SYM string <8> \"hi\\tthere\"..."),
            "got:\n{rendered}"
        );

        let ir = lower(&format!("s = \"{}\"\n", "a".repeat(25)));
        let rendered = ir.to_string();
        assert!(
            rendered.contains(&format!("PUSH_SYM string <25> \"{}\"...", "a".repeat(20))),
            "got:\n{rendered}"
        );
    }

    #[test]
    fn renders_array_and_call_operands() {
        let ir = lower("arr[1] = f(x, y)\n");
        let rendered = ir.to_string();
        assert!(rendered.contains("PUSH_ARRAY_SYM arr createAndRef"), "got:\n{rendered}");
        assert!(rendered.contains("SUBR_CALL f (2 arg)"), "got:\n{rendered}");
        assert!(rendered.contains("ARRAY_ASSIGN nDim=1"), "got:\n{rendered}");
    }
}
