//! Vector fields defined by a textual specification of the form
//! `time:t;par:omega;var:x,dx;fun:dx,sin(omega*t)-sin(x);`.
//!
//! The expressions are compiled into a register program. Each register
//! carries the truncated Taylor series of its subexpression along the
//! solution, and optionally the series of its partial derivatives with
//! respect to the initial condition; the program is re-evaluated one
//! coefficient at a time, which is what turns the chain rule into the
//! Taylor recurrence `a_{k+1} = L_k / (k+1)` without any symbolic
//! differentiation. Evaluating over [`crate::interval::Interval`] scalars
//! makes every produced coefficient a rigorous enclosure.

use crate::errors::SolverError;
use crate::field::VectorField;
use crate::traits::Scalar;
use anyhow::{anyhow, bail, Result};
use nalgebra::{DMatrix, DVector};
use std::collections::HashMap;

/// Register program operations. The output register of instruction `i` is
/// `i` itself; operands refer to earlier instructions, so a single forward
/// sweep per coefficient evaluates the whole expression DAG.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Instr {
    /// State variable; its series is written by the coefficient driver.
    Var(usize),
    Const(f64),
    Param(usize),
    /// The independent variable, with jet `(t, 1, 0, ...)`.
    Time,
    Add(usize, usize),
    Sub(usize, usize),
    Mul(usize, usize),
    Div(usize, usize),
    Neg(usize),
    /// Value series is sin(u); the auxiliary series holds cos(u).
    Sin(usize),
    /// Value series is cos(u); the auxiliary series holds sin(u).
    Cos(usize),
    Exp(usize),
    Log(usize),
    Sqrt(usize),
    /// Real power with a constant exponent.
    Pow(usize, f64),
}

/// A vector field compiled from the textual mini-language.
///
/// Generic over the scalar: `EquationField<f64>` gives the plain
/// evaluator used by the non-rigorous solver, `EquationField<Interval>`
/// the enclosure evaluator. Holds its own jet workspace, so concurrent
/// integrations need separate instances.
pub struct EquationField<T: Scalar> {
    instrs: Vec<Instr>,
    outputs: Vec<usize>,
    dim: usize,
    param_names: Vec<String>,
    params: Vec<T>,
    // jet workspace, lazily grown
    val: Vec<Vec<T>>,
    aux: Vec<Vec<T>>,
    der: Vec<Vec<Vec<T>>>,
    series_len: usize,
    der_dirs: usize,
}

impl<T: Scalar> EquationField<T> {
    /// Parses a specification `time:<name>;par:<names>;var:<names>;fun:<exprs>;`.
    /// The `time` and `par` sections are optional.
    pub fn parse(src: &str) -> Result<Self> {
        let mut time_name = None;
        let mut param_names: Vec<String> = Vec::new();
        let mut var_names: Vec<String> = Vec::new();
        let mut fun_src = None;

        for section in src.split(';') {
            let section = section.trim();
            if section.is_empty() {
                continue;
            }
            let (key, value) = section
                .split_once(':')
                .ok_or_else(|| anyhow!("malformed section {section:?}, expected key:value"))?;
            match key.trim() {
                "time" => time_name = Some(value.trim().to_string()),
                "par" => param_names = split_names(value),
                "var" => var_names = split_names(value),
                "fun" => fun_src = Some(value.to_string()),
                other => bail!("unknown section {other:?} in vector field specification"),
            }
        }

        if var_names.is_empty() {
            bail!("vector field specification has no var: section");
        }
        let fun_src = fun_src.ok_or_else(|| anyhow!("vector field specification has no fun: section"))?;
        let exprs = split_top_level(&fun_src);
        if exprs.len() != var_names.len() {
            bail!(
                "{} variables but {} equations in vector field specification",
                var_names.len(),
                exprs.len()
            );
        }

        let dim = var_names.len();
        let mut compiler = Compiler {
            instrs: (0..dim).map(Instr::Var).collect(),
            var_map: var_names
                .iter()
                .enumerate()
                .map(|(i, n)| (n.clone(), i))
                .collect(),
            param_map: param_names
                .iter()
                .enumerate()
                .map(|(i, n)| (n.clone(), i))
                .collect(),
            time_name,
        };

        let mut outputs = Vec::with_capacity(dim);
        for expr_src in &exprs {
            let ast = parse_expr(expr_src)?;
            outputs.push(compiler.compile(&ast)?);
        }

        let n_params = param_names.len();
        Ok(Self {
            instrs: compiler.instrs,
            outputs,
            dim,
            param_names,
            params: vec![T::zero(); n_params],
            val: Vec::new(),
            aux: Vec::new(),
            der: Vec::new(),
            series_len: 0,
            der_dirs: 0,
        })
    }

    pub fn set_param(&mut self, name: &str, value: T) -> Result<()> {
        let idx = self
            .param_names
            .iter()
            .position(|n| n == name)
            .ok_or_else(|| anyhow!("unknown parameter {name:?}"))?;
        self.params[idx] = value;
        Ok(())
    }

    fn ensure_workspace(&mut self, series_len: usize, der_dirs: usize) {
        let n = self.instrs.len();
        if self.val.len() < n || self.series_len < series_len {
            let len = series_len.max(self.series_len);
            self.val = vec![vec![T::zero(); len]; n];
            self.aux = vec![vec![T::zero(); len]; n];
            self.series_len = len;
            // derivative buffers must match the new series length
            self.der_dirs = 0;
            self.der.clear();
        }
        if der_dirs > 0 && self.der_dirs < der_dirs {
            self.der = vec![vec![vec![T::zero(); self.series_len]; der_dirs]; n];
            self.der_dirs = der_dirs;
        }
    }

    /// Computes coefficient `k` of every register, assuming coefficients
    /// `0..k` of all registers and `k` of the variable registers are in
    /// place.
    fn value_coeff(&mut self, k: usize, t: T) -> Result<(), SolverError> {
        for idx in 0..self.instrs.len() {
            let instr = self.instrs[idx];
            let v = match instr {
                Instr::Var(_) => continue,
                Instr::Const(c) => {
                    if k == 0 {
                        T::from_f64(c)
                    } else {
                        T::zero()
                    }
                }
                Instr::Param(p) => {
                    if k == 0 {
                        self.params[p]
                    } else {
                        T::zero()
                    }
                }
                Instr::Time => match k {
                    0 => t,
                    1 => T::one(),
                    _ => T::zero(),
                },
                Instr::Add(a, b) => self.val[a][k] + self.val[b][k],
                Instr::Sub(a, b) => self.val[a][k] - self.val[b][k],
                Instr::Neg(a) => -self.val[a][k],
                Instr::Mul(a, b) => {
                    let mut acc = T::zero();
                    for j in 0..=k {
                        acc += self.val[a][j] * self.val[b][k - j];
                    }
                    acc
                }
                Instr::Div(a, b) => {
                    let b0 = self.val[b][0];
                    if k == 0 && b0.contains_zero() {
                        return Err(singular("division by an expression containing zero"));
                    }
                    let mut acc = self.val[a][k];
                    for j in 0..k {
                        acc -= self.val[idx][j] * self.val[b][k - j];
                    }
                    acc / b0
                }
                Instr::Sin(u) => {
                    if k == 0 {
                        let u0 = self.val[u][0];
                        self.aux[idx][0] = u0.cos();
                        u0.sin()
                    } else {
                        let (s, c) = self.sin_cos_coeff(idx, u, k);
                        self.aux[idx][k] = c;
                        s
                    }
                }
                Instr::Cos(u) => {
                    if k == 0 {
                        let u0 = self.val[u][0];
                        self.aux[idx][0] = u0.sin();
                        u0.cos()
                    } else {
                        let (s, c) = self.cos_sin_coeff(idx, u, k);
                        self.aux[idx][k] = s;
                        c
                    }
                }
                Instr::Exp(u) => {
                    if k == 0 {
                        self.val[u][0].exp()
                    } else {
                        let mut acc = T::zero();
                        for j in 1..=k {
                            acc += T::from_f64(j as f64) * self.val[u][j] * self.val[idx][k - j];
                        }
                        acc / T::from_f64(k as f64)
                    }
                }
                Instr::Log(u) => {
                    let u0 = self.val[u][0];
                    if k == 0 {
                        if !u0.strictly_positive() {
                            return Err(singular("log of an expression not strictly positive"));
                        }
                        u0.ln()
                    } else {
                        let mut acc = T::zero();
                        for j in 1..k {
                            acc += T::from_f64(j as f64) * self.val[idx][j] * self.val[u][k - j];
                        }
                        (self.val[u][k] - acc / T::from_f64(k as f64)) / u0
                    }
                }
                Instr::Sqrt(u) => {
                    let u0 = self.val[u][0];
                    if k == 0 {
                        if !u0.strictly_positive() {
                            return Err(singular("sqrt of an expression not strictly positive"));
                        }
                        u0.sqrt()
                    } else {
                        let mut acc = self.val[u][k];
                        for j in 1..k {
                            acc -= self.val[idx][j] * self.val[idx][k - j];
                        }
                        let two = T::from_f64(2.0);
                        acc / (two * self.val[idx][0])
                    }
                }
                Instr::Pow(u, alpha) => {
                    let u0 = self.val[u][0];
                    if k == 0 {
                        if alpha.fract() == 0.0 && alpha.abs() < 1e9 {
                            if u0.contains_zero() {
                                return Err(singular("power of an expression containing zero"));
                            }
                            u0.powi(alpha as i32)
                        } else {
                            if !u0.strictly_positive() {
                                return Err(singular(
                                    "non-integer power of an expression not strictly positive",
                                ));
                            }
                            (T::from_f64(alpha) * u0.ln()).exp()
                        }
                    } else {
                        let a = T::from_f64(alpha);
                        let mut acc = T::zero();
                        for j in 0..k {
                            let factor =
                                a * T::from_f64((k - j) as f64) - T::from_f64(j as f64);
                            acc += factor * self.val[u][k - j] * self.val[idx][j];
                        }
                        acc / (T::from_f64(k as f64) * u0)
                    }
                }
            };
            self.val[idx][k] = v;
        }
        Ok(())
    }

    fn sin_cos_coeff(&self, idx: usize, u: usize, k: usize) -> (T, T) {
        let mut s = T::zero();
        let mut c = T::zero();
        for j in 1..=k {
            let ju = T::from_f64(j as f64) * self.val[u][j];
            s += ju * self.aux[idx][k - j];
            c += ju * self.val[idx][k - j];
        }
        let kk = T::from_f64(k as f64);
        (s / kk, -c / kk)
    }

    fn cos_sin_coeff(&self, idx: usize, u: usize, k: usize) -> (T, T) {
        // value series holds cos, aux holds sin
        let mut s = T::zero();
        let mut c = T::zero();
        for j in 1..=k {
            let ju = T::from_f64(j as f64) * self.val[u][j];
            s += ju * self.val[idx][k - j];
            c += ju * self.aux[idx][k - j];
        }
        let kk = T::from_f64(k as f64);
        (s / kk, -c / kk)
    }

    /// Computes derivative coefficient `k` in direction `dir` for every
    /// register; value coefficients through `k` must already be in place.
    fn der_coeff(&mut self, k: usize, dir: usize) {
        for idx in 0..self.instrs.len() {
            let instr = self.instrs[idx];
            let d = match instr {
                Instr::Var(_) => continue,
                Instr::Const(_) | Instr::Param(_) | Instr::Time => T::zero(),
                Instr::Add(a, b) => self.der[a][dir][k] + self.der[b][dir][k],
                Instr::Sub(a, b) => self.der[a][dir][k] - self.der[b][dir][k],
                Instr::Neg(a) => -self.der[a][dir][k],
                Instr::Mul(a, b) => {
                    let mut acc = T::zero();
                    for m in 0..=k {
                        acc += self.der[a][dir][m] * self.val[b][k - m];
                        acc += self.val[a][m] * self.der[b][dir][k - m];
                    }
                    acc
                }
                Instr::Div(a, b) => {
                    let mut acc = self.der[a][dir][k];
                    for m in 0..=k {
                        acc -= self.val[idx][m] * self.der[b][dir][k - m];
                    }
                    for m in 0..k {
                        acc -= self.der[idx][dir][m] * self.val[b][k - m];
                    }
                    acc / self.val[b][0]
                }
                Instr::Sin(u) => {
                    // d(sin u) = cos(u) du, with cos(u) in the aux series
                    let mut acc = T::zero();
                    for m in 0..=k {
                        acc += self.aux[idx][m] * self.der[u][dir][k - m];
                    }
                    acc
                }
                Instr::Cos(u) => {
                    let mut acc = T::zero();
                    for m in 0..=k {
                        acc += self.aux[idx][m] * self.der[u][dir][k - m];
                    }
                    -acc
                }
                Instr::Exp(u) => {
                    let mut acc = T::zero();
                    for m in 0..=k {
                        acc += self.val[idx][m] * self.der[u][dir][k - m];
                    }
                    acc
                }
                Instr::Log(u) => {
                    let mut acc = self.der[u][dir][k];
                    for m in 0..k {
                        acc -= self.der[idx][dir][m] * self.val[u][k - m];
                    }
                    acc / self.val[u][0]
                }
                Instr::Sqrt(u) => {
                    let mut acc = self.der[u][dir][k];
                    let two = T::from_f64(2.0);
                    for m in 0..k {
                        acc -= two * self.der[idx][dir][m] * self.val[idx][k - m];
                    }
                    acc / (two * self.val[idx][0])
                }
                Instr::Pow(u, alpha) => {
                    let a = T::from_f64(alpha);
                    let mut acc = T::zero();
                    for m in 0..=k {
                        acc += self.val[idx][m] * self.der[u][dir][k - m];
                    }
                    acc *= a;
                    for m in 0..k {
                        acc -= self.der[idx][dir][m] * self.val[u][k - m];
                    }
                    acc / self.val[u][0]
                }
            };
            self.der[idx][dir][k] = d;
        }
    }

    fn check_dim(&self, got: usize) -> Result<(), SolverError> {
        if got != self.dim {
            return Err(SolverError::DimensionMismatch {
                expected: self.dim,
                got,
            });
        }
        Ok(())
    }
}

fn singular(reason: &str) -> SolverError {
    SolverError::FieldEvaluation {
        reason: reason.to_string(),
    }
}

impl<T: Scalar> VectorField<T> for EquationField<T> {
    fn dimension(&self) -> usize {
        self.dim
    }

    fn eval(&mut self, t: T, x: &DVector<T>, out: &mut DVector<T>) -> Result<(), SolverError> {
        self.check_dim(x.len())?;
        self.ensure_workspace(1, 0);
        for i in 0..self.dim {
            self.val[i][0] = x[i];
        }
        self.value_coeff(0, t)?;
        for i in 0..self.dim {
            out[i] = self.val[self.outputs[i]][0];
        }
        Ok(())
    }

    fn jacobian(&mut self, t: T, x: &DVector<T>) -> Result<DMatrix<T>, SolverError> {
        self.check_dim(x.len())?;
        self.ensure_workspace(1, self.dim);
        for i in 0..self.dim {
            self.val[i][0] = x[i];
            for j in 0..self.dim {
                self.der[i][j][0] = if i == j { T::one() } else { T::zero() };
            }
        }
        self.value_coeff(0, t)?;
        for j in 0..self.dim {
            self.der_coeff(0, j);
        }
        let mut out = DMatrix::<T>::zeros(self.dim, self.dim);
        for i in 0..self.dim {
            for j in 0..self.dim {
                out[(i, j)] = self.der[self.outputs[i]][j][0];
            }
        }
        Ok(out)
    }

    fn ode_coefficients(
        &mut self,
        t: T,
        coeffs: &mut [DVector<T>],
        order: usize,
    ) -> Result<(), SolverError> {
        self.check_dim(coeffs[0].len())?;
        debug_assert!(coeffs.len() > order);
        self.ensure_workspace(order + 1, 0);
        for i in 0..self.dim {
            self.val[i][0] = coeffs[0][i];
        }
        for k in 0..order {
            self.value_coeff(k, t)?;
            let divisor = T::from_f64((k + 1) as f64);
            for i in 0..self.dim {
                let c = self.val[self.outputs[i]][k] / divisor;
                coeffs[k + 1][i] = c;
                self.val[i][k + 1] = c;
            }
        }
        Ok(())
    }

    fn ode_coefficients_variational(
        &mut self,
        t: T,
        coeffs: &mut [DVector<T>],
        mat_coeffs: &mut [DMatrix<T>],
        order: usize,
    ) -> Result<(), SolverError> {
        self.check_dim(coeffs[0].len())?;
        debug_assert!(coeffs.len() > order && mat_coeffs.len() > order);
        self.ensure_workspace(order + 1, self.dim);
        for i in 0..self.dim {
            self.val[i][0] = coeffs[0][i];
            for j in 0..self.dim {
                self.der[i][j][0] = mat_coeffs[0][(i, j)];
            }
        }
        for k in 0..order {
            self.value_coeff(k, t)?;
            for j in 0..self.dim {
                self.der_coeff(k, j);
            }
            let divisor = T::from_f64((k + 1) as f64);
            for i in 0..self.dim {
                let c = self.val[self.outputs[i]][k] / divisor;
                coeffs[k + 1][i] = c;
                self.val[i][k + 1] = c;
                for j in 0..self.dim {
                    let m = self.der[self.outputs[i]][j][k] / divisor;
                    mat_coeffs[k + 1][(i, j)] = m;
                    self.der[i][j][k + 1] = m;
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// parsing

fn split_names(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Splits the `fun:` section on commas outside parentheses.
fn split_top_level(src: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut current = String::new();
    for ch in src.chars() {
        match ch {
            '(' => {
                depth += 1;
                current.push(ch);
            }
            ')' => {
                depth = depth.saturating_sub(1);
                current.push(ch);
            }
            ',' if depth == 0 => {
                parts.push(current.trim().to_string());
                current = String::new();
            }
            _ => current.push(ch),
        }
    }
    if !current.trim().is_empty() {
        parts.push(current.trim().to_string());
    }
    parts
}

#[derive(Debug)]
enum Expr {
    Number(f64),
    Ident(String),
    Binary(Box<Expr>, char, Box<Expr>),
    Unary(Box<Expr>),
    Call(String, Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c.is_ascii_digit() || c == '.' {
            let mut num = String::new();
            while let Some(&d) = chars.peek() {
                if d.is_ascii_digit() || d == '.' {
                    num.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            if let Some(&e) = chars.peek() {
                if e == 'e' || e == 'E' {
                    let mut lookahead = chars.clone();
                    lookahead.next();
                    let mut exp = String::from("e");
                    if let Some(&sign) = lookahead.peek() {
                        if sign == '+' || sign == '-' {
                            exp.push(sign);
                            lookahead.next();
                        }
                    }
                    let mut digits = false;
                    while let Some(&d) = lookahead.peek() {
                        if d.is_ascii_digit() {
                            exp.push(d);
                            lookahead.next();
                            digits = true;
                        } else {
                            break;
                        }
                    }
                    if digits {
                        num.push_str(&exp);
                        chars = lookahead;
                    }
                }
            }
            let value: f64 = num
                .parse()
                .map_err(|_| anyhow!("malformed number literal {num:?}"))?;
            tokens.push(Token::Number(value));
        } else if c.is_alphabetic() || c == '_' {
            let mut ident = String::new();
            while let Some(&d) = chars.peek() {
                if d.is_alphanumeric() || d == '_' {
                    ident.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push(Token::Ident(ident));
        } else {
            match c {
                '+' => tokens.push(Token::Plus),
                '-' => tokens.push(Token::Minus),
                '*' => tokens.push(Token::Star),
                '/' => tokens.push(Token::Slash),
                '^' => tokens.push(Token::Caret),
                '(' => tokens.push(Token::LParen),
                ')' => tokens.push(Token::RParen),
                other => bail!("unexpected character {other:?} in expression"),
            }
            chars.next();
        }
    }
    Ok(tokens)
}

fn parse_expr(input: &str) -> Result<Expr> {
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.expression()?;
    if parser.pos != parser.tokens.len() {
        bail!("trailing tokens in expression {input:?}");
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn consume(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn expression(&mut self) -> Result<Expr> {
        let mut left = self.term()?;
        while let Some(token) = self.peek() {
            let op = match token {
                Token::Plus => '+',
                Token::Minus => '-',
                _ => break,
            };
            self.consume();
            let right = self.term()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn term(&mut self) -> Result<Expr> {
        let mut left = self.power()?;
        while let Some(token) = self.peek() {
            let op = match token {
                Token::Star => '*',
                Token::Slash => '/',
                _ => break,
            };
            self.consume();
            let right = self.power()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn power(&mut self) -> Result<Expr> {
        let mut left = self.unary()?;
        while let Some(Token::Caret) = self.peek() {
            self.consume();
            let right = self.unary()?;
            left = Expr::Binary(Box::new(left), '^', Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr> {
        if let Some(Token::Minus) = self.peek() {
            self.consume();
            let inner = self.unary()?;
            return Ok(Expr::Unary(Box::new(inner)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr> {
        match self.consume() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Ident(name)) => {
                if let Some(Token::LParen) = self.peek() {
                    self.consume();
                    let arg = self.expression()?;
                    match self.consume() {
                        Some(Token::RParen) => Ok(Expr::Call(name, Box::new(arg))),
                        _ => bail!("expected ')' after argument of {name}"),
                    }
                } else {
                    Ok(Expr::Ident(name))
                }
            }
            Some(Token::LParen) => {
                let expr = self.expression()?;
                match self.consume() {
                    Some(Token::RParen) => Ok(expr),
                    _ => bail!("expected ')'"),
                }
            }
            other => bail!("unexpected token {other:?} in expression"),
        }
    }
}

struct Compiler {
    instrs: Vec<Instr>,
    var_map: HashMap<String, usize>,
    param_map: HashMap<String, usize>,
    time_name: Option<String>,
}

impl Compiler {
    fn push(&mut self, instr: Instr) -> usize {
        self.instrs.push(instr);
        self.instrs.len() - 1
    }

    fn compile(&mut self, expr: &Expr) -> Result<usize> {
        match expr {
            Expr::Number(n) => Ok(self.push(Instr::Const(*n))),
            Expr::Ident(name) => {
                if let Some(&idx) = self.var_map.get(name) {
                    Ok(idx)
                } else if let Some(&idx) = self.param_map.get(name) {
                    Ok(self.push(Instr::Param(idx)))
                } else if self.time_name.as_deref() == Some(name.as_str()) {
                    Ok(self.push(Instr::Time))
                } else {
                    bail!("unknown identifier {name:?}")
                }
            }
            Expr::Unary(inner) => {
                let reg = self.compile(inner)?;
                Ok(self.push(Instr::Neg(reg)))
            }
            Expr::Binary(left, '^', right) => {
                let base = self.compile(left)?;
                if let Some(alpha) = literal_value(right) {
                    // small integer powers become multiplication chains so
                    // they stay defined on zero-containing enclosures
                    if alpha.fract() == 0.0 && (2.0..=8.0).contains(&alpha) {
                        let mut reg = base;
                        for _ in 1..(alpha as i64) {
                            reg = self.push(Instr::Mul(reg, base));
                        }
                        return Ok(reg);
                    }
                    return Ok(self.push(Instr::Pow(base, alpha)));
                }
                // variable exponent: a^b = exp(b * ln a)
                let ln = self.push(Instr::Log(base));
                let exponent = self.compile(right)?;
                let prod = self.push(Instr::Mul(exponent, ln));
                Ok(self.push(Instr::Exp(prod)))
            }
            Expr::Binary(left, op, right) => {
                let a = self.compile(left)?;
                let b = self.compile(right)?;
                let instr = match op {
                    '+' => Instr::Add(a, b),
                    '-' => Instr::Sub(a, b),
                    '*' => Instr::Mul(a, b),
                    '/' => Instr::Div(a, b),
                    other => bail!("unknown binary operator {other:?}"),
                };
                Ok(self.push(instr))
            }
            Expr::Call(func, arg) => {
                let reg = self.compile(arg)?;
                let instr = match func.as_str() {
                    "sin" => Instr::Sin(reg),
                    "cos" => Instr::Cos(reg),
                    "exp" => Instr::Exp(reg),
                    "log" | "ln" => Instr::Log(reg),
                    "sqrt" => Instr::Sqrt(reg),
                    other => bail!("unknown function {other:?}"),
                };
                Ok(self.push(instr))
            }
        }
    }
}

fn literal_value(expr: &Expr) -> Option<f64> {
    match expr {
        Expr::Number(n) => Some(*n),
        Expr::Unary(inner) => literal_value(inner).map(|v| -v),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interval::Interval;
    use approx::assert_relative_eq;

    fn factorial(k: usize) -> f64 {
        (1..=k).map(|v| v as f64).product::<f64>().max(1.0)
    }

    #[test]
    fn evaluates_pendulum_right_hand_side() {
        let mut field: EquationField<f64> =
            EquationField::parse("time:t;par:omega;var:x,dx;fun:dx,sin(omega*t)-sin(x);").unwrap();
        field.set_param("omega", 1.0).unwrap();
        let x = DVector::from_vec(vec![1.0, 2.0]);
        let mut out = DVector::zeros(2);
        field.eval(4.0, &x, &mut out).unwrap();
        assert_relative_eq!(out[0], 2.0);
        assert_relative_eq!(out[1], 4.0f64.sin() - 1.0f64.sin(), epsilon = 1e-15);
    }

    #[test]
    fn linear_field_coefficients_are_exponential_series() {
        let mut field: EquationField<f64> = EquationField::parse("var:x;fun:x;").unwrap();
        let order = 8;
        let mut coeffs: Vec<DVector<f64>> = (0..=order).map(|_| DVector::zeros(1)).collect();
        coeffs[0][0] = 2.0;
        field.ode_coefficients(0.0, &mut coeffs, order).unwrap();
        for (k, c) in coeffs.iter().enumerate() {
            assert_relative_eq!(c[0], 2.0 / factorial(k), epsilon = 1e-12);
        }
    }

    #[test]
    fn time_dependent_field_uses_time_jet() {
        // x' = t from x(2) = 0 has series 0 + 2 s + s^2 / 2 in the local time s
        let mut field: EquationField<f64> = EquationField::parse("time:t;var:x;fun:t;").unwrap();
        let mut coeffs: Vec<DVector<f64>> = (0..=3).map(|_| DVector::zeros(1)).collect();
        coeffs[0][0] = 0.0;
        field.ode_coefficients(2.0, &mut coeffs, 3).unwrap();
        assert_relative_eq!(coeffs[1][0], 2.0);
        assert_relative_eq!(coeffs[2][0], 0.5);
        assert_relative_eq!(coeffs[3][0], 0.0);
    }

    #[test]
    fn jacobian_matches_hand_derivative() {
        let mut field: EquationField<f64> =
            EquationField::parse("var:x,y;fun:x*y,x+sin(y);").unwrap();
        let x = DVector::from_vec(vec![0.7, -0.3]);
        let jac = field.jacobian(0.0, &x).unwrap();
        assert_relative_eq!(jac[(0, 0)], -0.3, epsilon = 1e-14);
        assert_relative_eq!(jac[(0, 1)], 0.7, epsilon = 1e-14);
        assert_relative_eq!(jac[(1, 0)], 1.0, epsilon = 1e-14);
        assert_relative_eq!(jac[(1, 1)], (-0.3f64).cos(), epsilon = 1e-14);
    }

    #[test]
    fn variational_coefficients_follow_linear_flow() {
        // x' = a x with a = 3: Phi(s) = e^{3 s}, matrix coefficient k is 3^k / k!
        let mut field: EquationField<f64> = EquationField::parse("par:a;var:x;fun:a*x;").unwrap();
        field.set_param("a", 3.0).unwrap();
        let order = 6;
        let mut coeffs: Vec<DVector<f64>> = (0..=order).map(|_| DVector::zeros(1)).collect();
        let mut mats: Vec<DMatrix<f64>> = (0..=order).map(|_| DMatrix::zeros(1, 1)).collect();
        coeffs[0][0] = 1.5;
        mats[0][(0, 0)] = 1.0;
        field
            .ode_coefficients_variational(0.0, &mut coeffs, &mut mats, order)
            .unwrap();
        for k in 0..=order {
            assert_relative_eq!(mats[k][(0, 0)], 3.0f64.powi(k as i32) / factorial(k), epsilon = 1e-10);
            assert_relative_eq!(coeffs[k][0], 1.5 * 3.0f64.powi(k as i32) / factorial(k), epsilon = 1e-10);
        }
    }

    #[test]
    fn interval_coefficients_enclose_point_coefficients() {
        let mut pf: EquationField<f64> =
            EquationField::parse("time:t;par:omega;var:x,dx;fun:dx,sin(omega*t)-sin(x);").unwrap();
        pf.set_param("omega", 1.0).unwrap();
        let mut itf: EquationField<Interval> =
            EquationField::parse("time:t;par:omega;var:x,dx;fun:dx,sin(omega*t)-sin(x);").unwrap();
        itf.set_param("omega", Interval::point(1.0)).unwrap();

        let order = 10;
        let mut pc: Vec<DVector<f64>> = (0..=order).map(|_| DVector::zeros(2)).collect();
        pc[0] = DVector::from_vec(vec![1.0, 2.0]);
        pf.ode_coefficients(4.0, &mut pc, order).unwrap();

        let mut ic: Vec<DVector<Interval>> = (0..=order)
            .map(|_| DVector::from_element(2, Interval::point(0.0)))
            .collect();
        ic[0] = DVector::from_vec(vec![Interval::point(1.0), Interval::point(2.0)]);
        itf.ode_coefficients(Interval::point(4.0), &mut ic, order)
            .unwrap();

        for k in 0..=order {
            for i in 0..2 {
                assert!(
                    ic[k][i].contains(pc[k][i]),
                    "coefficient {k},{i}: {} does not contain {}",
                    ic[k][i],
                    pc[k][i]
                );
                assert!(ic[k][i].width() < 1e-12);
            }
        }
    }

    #[test]
    fn division_by_zero_containing_interval_is_reported() {
        let mut field: EquationField<Interval> = EquationField::parse("var:x;fun:1/x;").unwrap();
        let mut coeffs: Vec<DVector<Interval>> = (0..=2)
            .map(|_| DVector::from_element(1, Interval::point(0.0)))
            .collect();
        coeffs[0][0] = Interval::new(-0.5, 0.5);
        let err = field
            .ode_coefficients(Interval::point(0.0), &mut coeffs, 2)
            .unwrap_err();
        assert!(matches!(err, SolverError::FieldEvaluation { .. }));
    }

    #[test]
    fn rejects_unknown_identifier() {
        let res: Result<EquationField<f64>> = EquationField::parse("var:x;fun:x+q;");
        assert!(res.is_err());
    }

    #[test]
    fn parses_powers_and_nested_calls() {
        let mut field: EquationField<f64> =
            EquationField::parse("var:x;fun:x^3+exp(sin(x))*sqrt(x+2);").unwrap();
        let x = DVector::from_vec(vec![0.5]);
        let mut out = DVector::zeros(1);
        field.eval(0.0, &x, &mut out).unwrap();
        let expected = 0.5f64.powi(3) + 0.5f64.sin().exp() * 2.5f64.sqrt();
        assert_relative_eq!(out[0], expected, epsilon = 1e-14);
    }
}
