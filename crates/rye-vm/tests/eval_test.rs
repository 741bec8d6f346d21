//! End-to-end evaluation tests: compile ASTs and run them through the
//! interpreter against a fresh global environment.

use rye_core::{ast, RyeError, Value};
use rye_vm::{compile, Interp, Runtime};

/// Evaluate a sequence of expressions in one environment, returning the
/// last result.
fn eval_all(rt: &Runtime, exprs: &[Value]) -> Result<Value, RyeError> {
    let mut interp = Interp::new(rt);
    let env = rt.new_global_env();
    let mut last = Value::null();
    for e in exprs {
        last = interp.eval_expr(e, &env)?;
    }
    Ok(last)
}

fn eval_one(expr: Value) -> Result<Value, RyeError> {
    let rt = Runtime::new();
    eval_all(&rt, &[expr])
}

#[test]
fn test_literal_arithmetic() {
    let rt = Runtime::new();
    let mut interp = Interp::new(&rt);
    let env = rt.new_global_env();
    let fun = compile(&rt, &ast::call("+", vec![ast::real(1.0), ast::real(2.0)])).unwrap();
    let sp = interp.stack_len();
    let result = interp.eval_function(&fun, &env).unwrap();
    assert_eq!(result.as_real_scalar(), Some(3.0));
    assert!(rt.visible.get());
    // the stack is balanced again once the result has been handed back
    assert_eq!(interp.stack_len(), sp);
    assert_eq!(interp.frame_len(), 0);
}

#[test]
fn test_lazy_argument_never_forced() {
    // f <- function(x) 1; f(stop("boom")) evaluates to 1: the promise for
    // x is never forced, so the error never fires.
    let result = eval_one(ast::block(vec![
        ast::assign(
            ast::sym("f"),
            ast::function(vec![("x", None)], ast::real(1.0)),
        ),
        ast::call("f", vec![ast::call("stop", vec![ast::str_("boom")])]),
    ]))
    .unwrap();
    assert_eq!(result.as_real_scalar(), Some(1.0));
}

#[test]
fn test_forced_argument_raises() {
    let err = eval_one(ast::block(vec![
        ast::assign(ast::sym("f"), ast::function(vec![("x", None)], ast::sym("x"))),
        ast::call("f", vec![ast::call("stop", vec![ast::str_("boom")])]),
    ]))
    .unwrap_err();
    assert_eq!(err.to_string(), "boom");
}

#[test]
fn test_promise_forced_once() {
    // f <- function(x) { x; x }: the second use returns the cached value,
    // so the warning side effect fires exactly once.
    let rt = Runtime::new();
    eval_all(
        &rt,
        &[ast::block(vec![
            ast::assign(
                ast::sym("f"),
                ast::function(
                    vec![("x", None)],
                    ast::block(vec![ast::sym("x"), ast::sym("x")]),
                ),
            ),
            ast::call("f", vec![ast::call("warning", vec![ast::str_("ping")])]),
        ])],
    )
    .unwrap();
    assert_eq!(rt.take_warnings(), vec!["ping".to_string()]);
}

#[test]
fn test_or_short_circuits() {
    let result = eval_one(ast::call(
        "||",
        vec![ast::lgl(true), ast::call("stop", vec![ast::str_("boom")])],
    ))
    .unwrap();
    assert_eq!(result.as_lgl_scalar(), Some(Some(true)));
}

#[test]
fn test_and_short_circuits() {
    let result = eval_one(ast::call(
        "&&",
        vec![ast::lgl(false), ast::call("stop", vec![ast::str_("boom")])],
    ))
    .unwrap();
    assert_eq!(result.as_lgl_scalar(), Some(Some(false)));
}

#[test]
fn test_three_valued_and() {
    let na = Value::lgl_na();
    for (lhs, rhs, want) in [
        (na.clone(), ast::lgl(false), Some(false)),
        (na.clone(), ast::lgl(true), None),
        (ast::lgl(false), na.clone(), Some(false)),
    ] {
        let result = eval_one(ast::call("&&", vec![lhs, rhs])).unwrap();
        assert_eq!(result.as_lgl_scalar(), Some(want));
    }
}

#[test]
fn test_three_valued_or() {
    let na = Value::lgl_na();
    for (lhs, rhs, want) in [
        (na.clone(), ast::lgl(true), Some(true)),
        (na.clone(), ast::lgl(false), None),
    ] {
        let result = eval_one(ast::call("||", vec![lhs, rhs])).unwrap();
        assert_eq!(result.as_lgl_scalar(), Some(want));
    }
}

#[test]
fn test_symbol_assignment_and_lookup() {
    let rt = Runtime::new();
    let result = eval_all(
        &rt,
        &[
            ast::assign(ast::sym("x"), ast::real(5.0)),
            ast::sym("x"),
        ],
    )
    .unwrap();
    assert_eq!(result.as_real_scalar(), Some(5.0));
}

#[test]
fn test_assignment_is_invisible_and_returns_rhs() {
    let rt = Runtime::new();
    let result = eval_all(&rt, &[ast::assign(ast::sym("x"), ast::real(5.0))]).unwrap();
    assert_eq!(result.as_real_scalar(), Some(5.0));
    assert!(!rt.visible.get());
    let result = eval_all(&rt, &[ast::real(7.0)]).unwrap();
    assert_eq!(result.as_real_scalar(), Some(7.0));
    assert!(rt.visible.get());
}

#[test]
fn test_unbound_variable() {
    let err = eval_one(ast::sym("ghost")).unwrap_err();
    assert_eq!(err.to_string(), "object 'ghost' not found");
}

#[test]
fn test_missing_argument_message() {
    let err = eval_one(ast::block(vec![
        ast::assign(ast::sym("f"), ast::function(vec![("x", None)], ast::sym("x"))),
        ast::call("f", vec![]),
    ]))
    .unwrap_err();
    assert_eq!(
        err.to_string(),
        "argument \"x\" is missing, with no default"
    );
}

#[test]
fn test_apply_non_function() {
    let err = eval_one(ast::block(vec![
        ast::assign(ast::sym("f"), ast::real(1.0)),
        Value::lang(
            ast::call("(", vec![ast::sym("f")]),
            vec![],
        ),
    ]))
    .unwrap_err();
    assert_eq!(err.to_string(), "attempt to apply non-function");
}

#[test]
fn test_default_argument_sees_sibling() {
    // f <- function(x, y = x + 1) y; f(10) == 11
    let result = eval_one(ast::block(vec![
        ast::assign(
            ast::sym("f"),
            ast::function(
                vec![
                    ("x", None),
                    ("y", Some(ast::call("+", vec![ast::sym("x"), ast::real(1.0)]))),
                ],
                ast::sym("y"),
            ),
        ),
        ast::call("f", vec![ast::real(10.0)]),
    ]))
    .unwrap();
    assert_eq!(result.as_real_scalar(), Some(11.0));
}

#[test]
fn test_named_argument_reordering() {
    // f <- function(x, y) x - y; f(y = 1, x = 10) == 9
    let result = eval_one(ast::block(vec![
        ast::assign(
            ast::sym("f"),
            ast::function(
                vec![("x", None), ("y", None)],
                ast::call("-", vec![ast::sym("x"), ast::sym("y")]),
            ),
        ),
        ast::call_tagged(
            "f",
            vec![
                ast::named("y", ast::real(1.0)),
                ast::named("x", ast::real(10.0)),
            ],
        ),
    ]))
    .unwrap();
    assert_eq!(result.as_real_scalar(), Some(9.0));
}

#[test]
fn test_dots_forwarding() {
    // f <- function(...) g(...); g <- function(a, b) a - b; f(10, 4) == 6
    let result = eval_one(ast::block(vec![
        ast::assign(
            ast::sym("g"),
            ast::function(
                vec![("a", None), ("b", None)],
                ast::call("-", vec![ast::sym("a"), ast::sym("b")]),
            ),
        ),
        ast::assign(
            ast::sym("f"),
            ast::function(vec![("...", None)], ast::call("g", vec![ast::sym("...")])),
        ),
        ast::call("f", vec![ast::real(10.0), ast::real(4.0)]),
    ]))
    .unwrap();
    assert_eq!(result.as_real_scalar(), Some(6.0));
}

#[test]
fn test_dd_var_lookup() {
    // f <- function(...) ..2; f(1, 42) == 42
    let result = eval_one(ast::block(vec![
        ast::assign(
            ast::sym("f"),
            ast::function(vec![("...", None)], ast::sym("..2")),
        ),
        ast::call("f", vec![ast::real(1.0), ast::real(42.0)]),
    ]))
    .unwrap();
    assert_eq!(result.as_real_scalar(), Some(42.0));
}

#[test]
fn test_while_loop_counts() {
    // n <- 0; while (n < 10) n <- n + 1; n
    let result = eval_one(ast::block(vec![
        ast::assign(ast::sym("n"), ast::real(0.0)),
        ast::call(
            "while",
            vec![
                ast::call("<", vec![ast::sym("n"), ast::real(10.0)]),
                ast::assign(ast::sym("n"), ast::call("+", vec![ast::sym("n"), ast::real(1.0)])),
            ],
        ),
        ast::sym("n"),
    ]))
    .unwrap();
    assert_eq!(result.as_real_scalar(), Some(10.0));
}

#[test]
fn test_while_returns_invisible_null() {
    let rt = Runtime::new();
    let result = eval_all(
        &rt,
        &[ast::call("while", vec![ast::lgl(false), ast::real(1.0)])],
    )
    .unwrap();
    assert!(result.is_null());
    assert!(!rt.visible.get());
}

#[test]
fn test_repeat_with_break() {
    // n <- 0; repeat { n <- n + 1; if (n == 3) break }; n
    let result = eval_one(ast::block(vec![
        ast::assign(ast::sym("n"), ast::real(0.0)),
        ast::call(
            "repeat",
            vec![ast::block(vec![
                ast::assign(ast::sym("n"), ast::call("+", vec![ast::sym("n"), ast::real(1.0)])),
                ast::call(
                    "if",
                    vec![
                        ast::call("==", vec![ast::sym("n"), ast::real(3.0)]),
                        ast::call("break", vec![]),
                    ],
                ),
            ])],
        ),
        ast::sym("n"),
    ]))
    .unwrap();
    assert_eq!(result.as_real_scalar(), Some(3.0));
}

#[test]
fn test_for_loop_accumulates() {
    // total <- 0; for (i in 1:5) total <- total + i; total
    let result = eval_one(ast::block(vec![
        ast::assign(ast::sym("total"), ast::real(0.0)),
        ast::call(
            "for",
            vec![
                ast::sym("i"),
                ast::call(":", vec![ast::int(1), ast::int(5)]),
                ast::assign(
                    ast::sym("total"),
                    ast::call("+", vec![ast::sym("total"), ast::sym("i")]),
                ),
            ],
        ),
        ast::sym("total"),
    ]))
    .unwrap();
    assert_eq!(result.as_real_scalar(), Some(15.0));
}

#[test]
fn test_for_loop_with_next() {
    // skip i == 2: total ends at 1 + 3 + 4 + 5 = 13
    let result = eval_one(ast::block(vec![
        ast::assign(ast::sym("total"), ast::real(0.0)),
        ast::call(
            "for",
            vec![
                ast::sym("i"),
                ast::call(":", vec![ast::int(1), ast::int(5)]),
                ast::block(vec![
                    ast::call(
                        "if",
                        vec![
                            ast::call("==", vec![ast::sym("i"), ast::int(2)]),
                            ast::call("next", vec![]),
                        ],
                    ),
                    ast::assign(
                        ast::sym("total"),
                        ast::call("+", vec![ast::sym("total"), ast::sym("i")]),
                    ),
                ]),
            ],
        ),
        ast::sym("total"),
    ]))
    .unwrap();
    assert_eq!(result.as_real_scalar(), Some(13.0));
}

#[test]
fn test_non_local_return_from_loop() {
    // f <- function() { for (i in 1:5) if (i == 3) return(i); 0 }
    let rt = Runtime::new();
    let mut interp = Interp::new(&rt);
    let env = rt.new_global_env();
    let define = ast::assign(
        ast::sym("f"),
        ast::function(
            vec![],
            ast::block(vec![
                ast::call(
                    "for",
                    vec![
                        ast::sym("i"),
                        ast::call(":", vec![ast::int(1), ast::int(5)]),
                        ast::call(
                            "if",
                            vec![
                                ast::call("==", vec![ast::sym("i"), ast::int(3)]),
                                ast::call("return", vec![ast::sym("i")]),
                            ],
                        ),
                    ],
                ),
                ast::real(0.0),
            ]),
        ),
    );
    interp.eval_expr(&define, &env).unwrap();
    let result = interp.eval_expr(&ast::call("f", vec![]), &env).unwrap();
    assert_eq!(result.as_int_scalar(), Some(3));
    // every frame installed on the way in was popped exactly once
    assert_eq!(interp.frame_len(), 0);
    assert_eq!(interp.stack_len(), 0);
}

#[test]
fn test_break_through_eval_reenters_loop_frame() {
    // for (i in 1:5) { n <- n + 1; eval(quote(break)) }: the break token
    // travels through the builtin re-entry and lands on the loop frame.
    let result = eval_one(ast::block(vec![
        ast::assign(ast::sym("n"), ast::real(0.0)),
        ast::call(
            "for",
            vec![
                ast::sym("i"),
                ast::call(":", vec![ast::int(1), ast::int(5)]),
                ast::block(vec![
                    ast::assign(
                        ast::sym("n"),
                        ast::call("+", vec![ast::sym("n"), ast::real(1.0)]),
                    ),
                    ast::call("eval", vec![ast::call("quote", vec![ast::call("break", vec![])])]),
                ]),
            ],
        ),
        ast::sym("n"),
    ]))
    .unwrap();
    assert_eq!(result.as_real_scalar(), Some(1.0));
}

#[test]
fn test_break_outside_loop_is_an_error() {
    let err = eval_one(ast::call("break", vec![])).unwrap_err();
    assert_eq!(
        err.to_string(),
        "no loop for break/next, jumping to top level"
    );
}

#[test]
fn test_return_outside_function_is_an_error() {
    let err = eval_one(ast::call("return", vec![ast::real(1.0)])).unwrap_err();
    assert_eq!(
        err.to_string(),
        "no function to return from, jumping to top level"
    );
}

#[test]
fn test_condition_of_length_zero() {
    let err = eval_one(ast::call("while", vec![ast::call("c", vec![]), ast::real(1.0)]))
        .unwrap_err();
    assert_eq!(err.to_string(), "argument is of length zero");
}

#[test]
fn test_condition_na() {
    let err = eval_one(ast::call("while", vec![Value::lgl_na(), ast::real(1.0)])).unwrap_err();
    assert_eq!(err.to_string(), "missing value where TRUE/FALSE needed");
}

#[test]
fn test_condition_non_logical() {
    let err =
        eval_one(ast::call("while", vec![ast::str_("banana"), ast::real(1.0)])).unwrap_err();
    assert_eq!(err.to_string(), "argument is not interpretable as logical");
}

#[test]
fn test_long_condition_warns_and_uses_first() {
    let rt = Runtime::new();
    let result = eval_all(
        &rt,
        &[ast::block(vec![
            ast::call(
                "while",
                vec![
                    ast::call("c", vec![ast::lgl(true), ast::lgl(false)]),
                    ast::call("break", vec![]),
                ],
            ),
            ast::real(1.0),
        ])],
    )
    .unwrap();
    assert_eq!(result.as_real_scalar(), Some(1.0));
    let warnings = rt.take_warnings();
    assert!(warnings
        .iter()
        .any(|w| w.contains("condition has length > 1")));
}

#[test]
fn test_extract_fast_path_and_fallback() {
    // c(10, 20)[[2]] via the fast path
    let result = eval_one(ast::call(
        "[[",
        vec![
            ast::call("c", vec![ast::real(10.0), ast::real(20.0)]),
            ast::real(2.0),
        ],
    ))
    .unwrap();
    assert_eq!(result.as_real_scalar(), Some(20.0));

    // out-of-range index falls back to the builtin, which raises the usual
    // recoverable condition
    let err = eval_one(ast::call(
        "[[",
        vec![
            ast::call("c", vec![ast::real(10.0), ast::real(20.0)]),
            ast::real(5.0),
        ],
    ))
    .unwrap_err();
    assert_eq!(err.to_string(), "subscript out of bounds");
}

#[test]
fn test_subset_keeps_vector_type() {
    let result = eval_one(ast::call(
        "[",
        vec![
            ast::call("c", vec![ast::real(10.0), ast::real(20.0), ast::real(30.0)]),
            ast::call("c", vec![ast::int(1), ast::int(3)]),
        ],
    ))
    .unwrap();
    assert_eq!(result, Value::reals(vec![10.0, 30.0]));
}

#[test]
fn test_list_extract_by_name() {
    // list(a = 1, b = 2)$b == 2
    let result = eval_one(ast::call(
        "$",
        vec![
            ast::call_tagged(
                "list",
                vec![
                    ast::named("a", ast::real(1.0)),
                    ast::named("b", ast::real(2.0)),
                ],
            ),
            ast::sym("b"),
        ],
    ))
    .unwrap();
    assert_eq!(result.as_real_scalar(), Some(2.0));
}

#[test]
fn test_complex_assignment_nested() {
    // x <- list(a = list(b = 1)); x$a$b <- 2
    let rt = Runtime::new();
    let mut interp = Interp::new(&rt);
    let env = rt.new_global_env();
    let setup = ast::assign(
        ast::sym("x"),
        ast::call_tagged(
            "list",
            vec![ast::named(
                "a",
                ast::call_tagged("list", vec![ast::named("b", ast::real(1.0))]),
            )],
        ),
    );
    interp.eval_expr(&setup, &env).unwrap();
    // alias the inner list before the update
    interp
        .eval_expr(
            &ast::assign(ast::sym("y"), ast::call("$", vec![ast::sym("x"), ast::sym("a")])),
            &env,
        )
        .unwrap();

    let update = ast::assign(
        ast::call("$", vec![ast::call("$", vec![ast::sym("x"), ast::sym("a")]), ast::sym("b")]),
        ast::real(2.0),
    );
    interp.eval_expr(&update, &env).unwrap();

    let read = ast::call(
        "$",
        vec![ast::call("$", vec![ast::sym("x"), ast::sym("a")]), ast::sym("b")],
    );
    let result = interp.eval_expr(&read, &env).unwrap();
    assert_eq!(result.as_real_scalar(), Some(2.0));

    // the alias still sees the old value: no sharing with the updated list
    let old = interp
        .eval_expr(&ast::call("$", vec![ast::sym("y"), ast::sym("b")]), &env)
        .unwrap();
    assert_eq!(old.as_real_scalar(), Some(1.0));
    assert_eq!(interp.stack_len(), 0);
}

#[test]
fn test_complex_assignment_single_level() {
    // x <- c(1, 2, 3); x[[2]] <- 9; x
    let result = eval_one(ast::block(vec![
        ast::assign(
            ast::sym("x"),
            ast::call("c", vec![ast::real(1.0), ast::real(2.0), ast::real(3.0)]),
        ),
        ast::assign(
            ast::call("[[", vec![ast::sym("x"), ast::int(2)]),
            ast::real(9.0),
        ),
        ast::sym("x"),
    ]))
    .unwrap();
    assert_eq!(result, Value::reals(vec![1.0, 9.0, 3.0]));
}

#[test]
fn test_class_replacement_via_setter() {
    // x <- c(1); class(x) <- "gauge"; class(x)
    let result = eval_one(ast::block(vec![
        ast::assign(ast::sym("x"), ast::call("c", vec![ast::real(1.0)])),
        ast::assign(
            ast::call("class", vec![ast::sym("x")]),
            ast::str_("gauge"),
        ),
        ast::call("class", vec![ast::sym("x")]),
    ]))
    .unwrap();
    assert_eq!(result.as_str_scalar().as_deref(), Some("gauge"));
}

#[test]
fn test_s3_dispatch_through_print() {
    // print.probe <- function(x) "probed"; print(x) picks the method
    let rt = Runtime::new();
    let result = eval_all(
        &rt,
        &[ast::block(vec![
            ast::assign(
                ast::sym("print.probe"),
                ast::function(vec![("x", None)], ast::str_("probed")),
            ),
            ast::assign(ast::sym("x"), ast::call("c", vec![ast::real(1.0)])),
            ast::assign(ast::call("class", vec![ast::sym("x")]), ast::str_("probe")),
            ast::call("print", vec![ast::sym("x")]),
        ])],
    )
    .unwrap();
    assert_eq!(result.as_str_scalar().as_deref(), Some("probed"));
}

#[test]
fn test_print_default_path() {
    let rt = Runtime::new();
    let result = eval_all(&rt, &[ast::call("print", vec![ast::real(7.0)])]).unwrap();
    assert_eq!(result.as_real_scalar(), Some(7.0));
    assert_eq!(rt.take_output(), vec!["7".to_string()]);
}

#[test]
fn test_bracket_dispatch_to_s3_method() {
    // `[[.roster` <- function(x, i) "from-method"; x[[1]] dispatches
    let result = eval_one(ast::block(vec![
        ast::assign(
            ast::sym("[[.roster"),
            ast::function(vec![("x", None), ("i", None)], ast::str_("from-method")),
        ),
        ast::assign(ast::sym("x"), ast::call("list", vec![ast::real(1.0)])),
        ast::assign(ast::call("class", vec![ast::sym("x")]), ast::str_("roster")),
        ast::call("[[", vec![ast::sym("x"), ast::int(1)]),
    ]))
    .unwrap();
    assert_eq!(result.as_str_scalar().as_deref(), Some("from-method"));
}

#[test]
fn test_bracket_dispatch_falls_back_to_builtin() {
    // no `[[.bag` method anywhere: the dispatch falls through to the
    // ordinary resolution of `[[`
    let result = eval_one(ast::block(vec![
        ast::assign(ast::sym("x"), ast::call("list", vec![ast::real(42.0)])),
        ast::assign(ast::call("class", vec![ast::sym("x")]), ast::str_("bag")),
        ast::call("[[", vec![ast::sym("x"), ast::int(1)]),
    ]))
    .unwrap();
    assert_eq!(result.as_real_scalar(), Some(42.0));
}

#[test]
fn test_s4_dispatch_precedes_s3() {
    // a formal method on `[[` for class "gauge" wins over the default path
    let result = eval_one(ast::block(vec![
        ast::call(
            "setMethod",
            vec![
                ast::str_("[["),
                ast::str_("gauge"),
                ast::function(vec![("x", None), ("i", None)], ast::str_("formal")),
            ],
        ),
        ast::assign(ast::sym("x"), ast::call("list", vec![ast::real(1.0)])),
        ast::assign(ast::call("class", vec![ast::sym("x")]), ast::str_("gauge")),
        ast::assign(ast::sym("x"), ast::call("asS4", vec![ast::sym("x")])),
        ast::call("[[", vec![ast::sym("x"), ast::int(1)]),
    ]))
    .unwrap();
    assert_eq!(result.as_str_scalar().as_deref(), Some("formal"));
}

#[test]
fn test_shadowed_operator_takes_slow_path() {
    // `+` <- function(a, b) 42; the guard side-exits and the user binding
    // wins over the inlined fast path
    let result = eval_one(ast::block(vec![
        ast::assign(
            ast::sym("+"),
            ast::function(vec![("a", None), ("b", None)], ast::real(42.0)),
        ),
        ast::call("+", vec![ast::real(1.0), ast::real(2.0)]),
    ]))
    .unwrap();
    assert_eq!(result.as_real_scalar(), Some(42.0));
}

#[test]
fn test_shadowed_while_takes_slow_path() {
    let result = eval_one(ast::block(vec![
        ast::assign(
            ast::sym("while"),
            ast::function(vec![("a", None), ("b", None)], ast::str_("not-a-loop")),
        ),
        ast::call("while", vec![ast::lgl(true), ast::real(1.0)]),
    ]))
    .unwrap();
    assert_eq!(result.as_str_scalar().as_deref(), Some("not-a-loop"));
}

#[test]
fn test_quote_returns_ast() {
    let result = eval_one(ast::call(
        "quote",
        vec![ast::call("f", vec![ast::sym("x")])],
    ))
    .unwrap();
    assert_eq!(result, ast::call("f", vec![ast::sym("x")]));
}

#[test]
fn test_eval_of_quoted_expression() {
    let result = eval_one(ast::block(vec![
        ast::assign(ast::sym("x"), ast::real(6.0)),
        ast::call(
            "eval",
            vec![ast::call(
                "quote",
                vec![ast::call("+", vec![ast::sym("x"), ast::real(1.0)])],
            )],
        ),
    ]))
    .unwrap();
    assert_eq!(result.as_real_scalar(), Some(7.0));
}

#[test]
fn test_integer_arithmetic_stays_integer() {
    let result = eval_one(ast::call("+", vec![ast::int(2), ast::int(3)])).unwrap();
    assert_eq!(result.as_int_scalar(), Some(5));
}

#[test]
fn test_closure_env_is_lexical() {
    // make_adder <- function(n) function(x) x + n; add2 <- make_adder(2)
    let result = eval_one(ast::block(vec![
        ast::assign(
            ast::sym("make_adder"),
            ast::function(
                vec![("n", None)],
                ast::function(
                    vec![("x", None)],
                    ast::call("+", vec![ast::sym("x"), ast::sym("n")]),
                ),
            ),
        ),
        ast::assign(ast::sym("add2"), ast::call("make_adder", vec![ast::real(2.0)])),
        ast::call("add2", vec![ast::real(40.0)]),
    ]))
    .unwrap();
    assert_eq!(result.as_real_scalar(), Some(42.0));
}

#[test]
fn test_self_evaluating_constant_is_locked() {
    let rt = Runtime::new();
    let mut interp = Interp::new(&rt);
    let env = rt.new_global_env();
    let v = Value::reals(vec![1.0, 2.0]);
    let out = interp.eval_expr(&v, &env).unwrap();
    assert!(out.maybe_shared());
    assert!(out.ptr_eq(&v));
}

#[test]
fn test_invisible_builtin() {
    let rt = Runtime::new();
    let result = eval_all(&rt, &[ast::call("invisible", vec![ast::real(3.0)])]).unwrap();
    assert_eq!(result.as_real_scalar(), Some(3.0));
    assert!(!rt.visible.get());
}
