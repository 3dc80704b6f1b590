//! Common-subexpression elimination
//!
//! The CSE worker prints symbolic expressions for the target language,
//! factoring repeated composite subexpressions into serial-numbered
//! temporaries. Temporary declarations are deferred: the worker hands back
//! `(name, printed body)` pairs and the macro agent decides where they land
//! in the output (see the temporary pool handling in `agent`).
//!
//! The serial counter is scoped to the whole translation unit and never
//! resets mid-file, so temporary names stay unique across statements. The
//! shared [`ExpressionCache`] memoizes printed subexpressions across calls
//! and tracks hit/miss counts plus cumulative query/insert time for
//! diagnostics.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::error::TranslatorError;
use crate::expr::Expr;
use crate::printer::LanguagePrinter;

/// Hit/miss and timing counters for the expression cache.
#[derive(Clone, Copy, Debug, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub query_time: Duration,
    pub insert_time: Duration,
}

/// Memoization table mapping structural expressions to the symbol that
/// already holds their printed value.
#[derive(Debug, Default)]
pub struct ExpressionCache {
    map: HashMap<Expr, String>,
    stats: CacheStats,
}

impl ExpressionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the symbol for `expr`, counting the hit or miss.
    pub fn query(&mut self, expr: &Expr) -> Option<String> {
        let start = Instant::now();
        let found = self.map.get(expr).cloned();
        self.stats.query_time += start.elapsed();
        match found {
            Some(symbol) => {
                self.stats.hits += 1;
                Some(symbol)
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    pub fn insert(&mut self, expr: Expr, symbol: String) {
        let start = Instant::now();
        self.map.insert(expr, symbol);
        self.stats.insert_time += start.elapsed();
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// A deferred temporary declaration: `name` holds `body`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Temporary {
    pub name: String,
    pub body: String,
}

/// Prints expressions, factoring repeated subexpressions into temporaries.
#[derive(Debug)]
pub struct CseWorker {
    enabled: bool,
    serial: u64,
    temp_prefix: String,
    deferred: Vec<Temporary>,
    cache: ExpressionCache,
    statement_base: u64,
}

impl CseWorker {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            serial: 0,
            temp_prefix: "t".to_string(),
            deferred: Vec::new(),
            cache: ExpressionCache::new(),
            statement_base: 0,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Prefix used for temporary names.
    pub fn temp_prefix(&self) -> &str {
        &self.temp_prefix
    }

    fn next_temp(&mut self) -> String {
        let name = format!("{}{}", self.temp_prefix, self.serial);
        self.serial += 1;
        name
    }

    /// Print `expr`, deferring temporaries for repeated composite
    /// subexpressions when CSE is enabled.
    pub fn print(
        &mut self,
        expr: &Expr,
        printer: &dyn LanguagePrinter,
    ) -> Result<String, TranslatorError> {
        self.print_node(expr, printer, 0)
    }

    fn print_node(
        &mut self,
        expr: &Expr,
        printer: &dyn LanguagePrinter,
        depth: usize,
    ) -> Result<String, TranslatorError> {
        match expr {
            Expr::Int(value) => Ok(value.to_string()),
            Expr::Sym(name) => Ok(name.clone()),
            composite => {
                if self.enabled && depth > 0 {
                    if let Some(symbol) = self.cache.query(composite) {
                        return Ok(symbol);
                    }
                    // The body becomes a standalone declaration, so it
                    // prints at top level (no grouping parentheses).
                    let body = self.print_composite(composite, printer, 0)?;
                    let name = self.next_temp();
                    self.deferred.push(Temporary {
                        name: name.clone(),
                        body,
                    });
                    self.cache.insert(composite.clone(), name.clone());
                    Ok(name)
                } else {
                    self.print_composite(composite, printer, depth)
                }
            }
        }
    }

    fn print_composite(
        &mut self,
        expr: &Expr,
        printer: &dyn LanguagePrinter,
        depth: usize,
    ) -> Result<String, TranslatorError> {
        match expr {
            Expr::Add(terms) => {
                if terms.is_empty() {
                    return Err(TranslatorError::Internal("empty sum node".to_string()));
                }
                let printed = self.print_children(terms, printer, depth)?;
                Ok(Self::grouped(
                    printer.print_operands(&printed, printer.add_op()),
                    depth,
                ))
            }
            Expr::Mul(factors) => {
                if factors.is_empty() {
                    return Err(TranslatorError::Internal("empty product node".to_string()));
                }
                let printed = self.print_children(factors, printer, depth)?;
                Ok(Self::grouped(
                    printer.print_operands(&printed, printer.mul_op()),
                    depth,
                ))
            }
            Expr::Pow(base, exponent) => {
                // Composite bases come back either as a temporary name or
                // already parenthesized by the raw-print path.
                let base_text = self.print_node(base, printer, depth + 1)?;
                Ok(printer.print_pow(&base_text, *exponent))
            }
            Expr::Call(name, args) => {
                if name.is_empty() {
                    return Err(TranslatorError::Internal(
                        "call node with empty function name".to_string(),
                    ));
                }
                let printed = self.print_children(args, printer, depth)?;
                Ok(format!("{}({})", name, printed.join(",")))
            }
            Expr::Int(_) | Expr::Sym(_) => self.print_node(expr, printer, depth),
        }
    }

    fn print_children(
        &mut self,
        children: &[Expr],
        printer: &dyn LanguagePrinter,
        depth: usize,
    ) -> Result<Vec<String>, TranslatorError> {
        children
            .iter()
            .map(|child| self.print_node(child, printer, depth + 1))
            .collect()
    }

    // With CSE enabled composite operands collapse to temporary names, so
    // grouping parentheses are only needed on the raw-print path.
    fn grouped(text: String, depth: usize) -> String {
        if depth > 0 {
            format!("({})", text)
        } else {
            text
        }
    }

    /// Take every deferred temporary accumulated since the last drain.
    pub fn drain(&mut self) -> Vec<Temporary> {
        std::mem::take(&mut self.deferred)
    }

    /// Statement bracket: record the serial position so per-statement
    /// temporary counts can be traced.
    pub fn begin_statement(&mut self) {
        self.statement_base = self.serial;
    }

    pub fn end_statement(&mut self) {
        let emitted = self.serial - self.statement_base;
        if emitted > 0 {
            tracing::trace!(temporaries = emitted, "statement CSE");
        }
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Emit cumulative cache statistics through tracing.
    pub fn log_stats(&self) {
        let stats = self.stats();
        tracing::debug!(
            hits = stats.hits,
            misses = stats.misses,
            query_us = stats.query_time.as_micros() as u64,
            insert_us = stats.insert_time.as_micros() as u64,
            temporaries = self.serial,
            "expression cache"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::printer::CLikePrinter;
    use pretty_assertions::assert_eq;

    fn sum_of_products() -> Expr {
        // x*y + x*y: the repeated product should become one temporary.
        let product = Expr::mul(vec![Expr::sym("x"), Expr::sym("y")]);
        Expr::add(vec![product.clone(), product])
    }

    #[test]
    fn repeated_subexpression_becomes_one_temporary() {
        let mut worker = CseWorker::new(true);
        let printer = CLikePrinter::new();

        let text = worker.print(&sum_of_products(), &printer).unwrap();
        assert_eq!(text, "t0+t0");

        let temps = worker.drain();
        assert_eq!(temps.len(), 1);
        assert_eq!(temps[0].name, "t0");
        assert_eq!(temps[0].body, "x*y");

        let stats = worker.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn disabled_worker_prints_inline() {
        let mut worker = CseWorker::new(false);
        let printer = CLikePrinter::new();

        let text = worker.print(&sum_of_products(), &printer).unwrap();
        assert_eq!(text, "(x*y)+(x*y)");
        assert!(worker.drain().is_empty());
    }

    #[test]
    fn serial_counter_never_resets() {
        let mut worker = CseWorker::new(true);
        let printer = CLikePrinter::new();

        // Only nested composites become temporaries, so wrap each product
        // in a sum.
        let first = Expr::add(vec![
            Expr::mul(vec![Expr::sym("a"), Expr::sym("b")]),
            Expr::int(1),
        ]);
        let second = Expr::add(vec![
            Expr::mul(vec![Expr::sym("c"), Expr::sym("d")]),
            Expr::int(1),
        ]);

        worker.print(&first, &printer).unwrap();
        worker.drain();
        worker.print(&second, &printer).unwrap();

        let temps = worker.drain();
        assert_eq!(temps.len(), 1);
        assert_eq!(temps[0].name, "t1");
    }

    #[test]
    fn pow_goes_through_printer_specialization() {
        let mut worker = CseWorker::new(false);
        let printer = CLikePrinter::new();

        let expr = Expr::pow(Expr::sym("H"), 2);
        assert_eq!(worker.print(&expr, &printer).unwrap(), "H*H");

        let expr = Expr::pow(Expr::add(vec![Expr::sym("a"), Expr::sym("b")]), 4);
        assert_eq!(worker.print(&expr, &printer).unwrap(), "pow((a+b),4)");
    }

    #[test]
    fn malformed_node_is_fatal() {
        let mut worker = CseWorker::new(true);
        let printer = CLikePrinter::new();

        let err = worker.print(&Expr::Add(vec![]), &printer).unwrap_err();
        assert!(!err.is_recoverable());
    }
}
