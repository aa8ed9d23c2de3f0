use crate::compiler::code::CodeObject;
use crate::error::{SiltError, SiltResult, Span};
use crate::vm::value::Value;
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// Binding progresses through these states; the entry state and the skipped
/// states are decided up front from the signature's shape and the call's
/// shape. Loitering in one state at a time keeps each filling rule separate
/// and makes the next transition explicit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BindState {
    Positional,
    KeywordOverride,
    KeywordOrDefault,
    Variable,
    KeywordOnly,
    Finished,
}

/// Map a call site's positional and keyword arguments onto a callee's
/// parameter slots.
///
/// The output is the flat slot array in declared order: positional and
/// defaulted slots, then the variable-positional tuple (if declared), then
/// keyword-only slots. Slots are filled strictly left to right, so the
/// transition structure itself guarantees every slot is filled exactly once
/// before `Finished`.
///
/// Keyword arguments that match no declared parameter are ignored; the
/// machine stays permissive there on purpose.
///
/// This is a pure function of (signature, arguments): no state, no I/O, safe
/// to call concurrently for unrelated calls.
pub fn bind(
    co: &CodeObject,
    args: &[Value],
    keywords: Option<&FxHashMap<Arc<str>, Value>>,
) -> SiltResult<Vec<Value>> {
    let has_defaults = !co.defaults.is_empty();
    let has_keywords = keywords.map(|k| !k.is_empty()).unwrap_or(false);
    let has_kwonly = co.kwonly_count > 0;
    let total_slots = co.arg_count + usize::from(co.has_varargs) + co.kwonly_count;

    let lookup = |name: &str| -> Option<Value> {
        keywords.and_then(|k| k.get(name)).cloned()
    };

    let mut out: Vec<Value> = Vec::with_capacity(total_slots);
    let mut in_i = 0usize;

    let mut state = if co.arg_count > 0 {
        BindState::Positional
    } else if co.has_varargs {
        BindState::Variable
    } else if !args.is_empty() {
        return Err(arity_error(co, args.len()));
    } else if has_kwonly {
        BindState::KeywordOnly
    } else {
        BindState::Finished
    };

    while state != BindState::Finished {
        match state {
            BindState::Positional => {
                while in_i < args.len() && in_i < co.arg_count {
                    out.push(args[in_i].clone());
                    in_i += 1;
                }

                if in_i < co.arg_count {
                    if has_keywords || has_defaults {
                        state = BindState::KeywordOverride;
                    } else if co.has_varargs {
                        state = BindState::Variable;
                    } else {
                        return Err(missing_error(co, &co.varnames[in_i..co.arg_count]));
                    }
                } else if args.len() > co.arg_count && !co.has_varargs {
                    return Err(arity_error(co, args.len()));
                } else if co.has_varargs {
                    state = BindState::Variable;
                } else if has_kwonly {
                    state = BindState::KeywordOnly;
                } else {
                    state = BindState::Finished;
                }
            }

            BindState::KeywordOverride => {
                // Fill the still-required slots from exact-name keywords;
                // anything left unmatched is reported all at once.
                let required = co.arg_count - co.defaults.len();
                let mut slot_i = out.len();
                let mut missing: Vec<Arc<str>> = Vec::new();
                while in_i < required {
                    let name = co.varnames[slot_i].clone();
                    match lookup(&name) {
                        Some(value) => out.push(value),
                        None => missing.push(name),
                    }
                    in_i += 1;
                    slot_i += 1;
                }

                if !missing.is_empty() {
                    return Err(missing_error(co, &missing));
                }
                if has_defaults {
                    state = BindState::KeywordOrDefault;
                } else if co.has_varargs {
                    state = BindState::Variable;
                } else if has_kwonly {
                    state = BindState::KeywordOnly;
                } else {
                    state = BindState::Finished;
                }
            }

            BindState::KeywordOrDefault => {
                // Some defaulted slots may already hold a positional value or
                // a keyword override, so the first default in play is not
                // necessarily the first declared one.
                let mut default_i = out.len() - (co.arg_count - co.defaults.len());
                while default_i < co.defaults.len() || out.len() < co.arg_count {
                    let name = co.varnames[out.len()].clone();
                    if let Some(value) = lookup(&name) {
                        out.push(value);
                    } else if default_i < co.defaults.len() {
                        out.push(co.defaults[default_i].clone());
                    } else {
                        return Err(arity_error(co, args.len()));
                    }
                    default_i += 1;
                }

                if co.has_varargs {
                    state = BindState::Variable;
                } else if has_kwonly {
                    state = BindState::KeywordOnly;
                } else {
                    state = BindState::Finished;
                }
            }

            BindState::Variable => {
                // Every leftover positional argument lands in the tuple; no
                // leftovers still bind an empty tuple, never a hole.
                let leftovers: Vec<Value> = args[in_i.min(args.len())..].to_vec();
                in_i = args.len();
                out.push(Value::tuple(leftovers));

                if has_kwonly {
                    state = BindState::KeywordOnly;
                } else {
                    state = BindState::Finished;
                }
            }

            BindState::KeywordOnly => {
                for _ in 0..co.kwonly_count {
                    let name = co.varnames[out.len()].clone();
                    if let Some(value) = lookup(&name) {
                        out.push(value);
                    } else if let Some(default) = co.kw_defaults.get(&*name) {
                        out.push(default.clone());
                    } else {
                        return Err(SiltError::type_error(
                            format!(
                                "{}() missing required keyword-only argument: '{}'",
                                co.name, name
                            ),
                            Span::default(),
                            &co.file,
                        ));
                    }
                }
                state = BindState::Finished;
            }

            BindState::Finished => unreachable!("loop exits before Finished"),
        }
    }

    debug_assert_eq!(out.len(), total_slots);
    Ok(out)
}

fn arity_error(co: &CodeObject, given: usize) -> SiltError {
    SiltError::type_error(
        format!(
            "{}() takes {} positional argument{} but {} {} given",
            co.name,
            co.arg_count,
            if co.arg_count == 1 { "" } else { "s" },
            given,
            if given == 1 { "was" } else { "were" },
        ),
        Span::default(),
        &co.file,
    )
}

fn missing_error(co: &CodeObject, names: &[Arc<str>]) -> SiltError {
    SiltError::type_error(
        format!(
            "{}() missing {} required positional argument{}: {}",
            co.name,
            names.len(),
            if names.len() == 1 { "" } else { "s" },
            join_names(names),
        ),
        Span::default(),
        &co.file,
    )
}

/// `'x'`, `'x' and 'y'`, `'x', 'y', and 'z'`.
fn join_names(names: &[Arc<str>]) -> String {
    match names {
        [] => String::new(),
        [only] => format!("'{}'", only),
        [first, second] => format!("'{}' and '{}'", first, second),
        [init @ .., last] => {
            let mut joined = init
                .iter()
                .map(|n| format!("'{}'", n))
                .collect::<Vec<_>>()
                .join(", ");
            joined.push_str(&format!(", and '{}'", last));
            joined
        }
    }
}

/// One candidate shape in an [`OverloadTable`].
#[derive(Debug, Clone)]
pub struct OverloadSig {
    /// Parameters that must be supplied.
    pub required: usize,
    /// Additional defaulted parameters.
    pub optional: usize,
    pub has_varargs: bool,
    /// Names bindable by keyword.
    pub keyword_names: Vec<Arc<str>>,
}

impl OverloadSig {
    fn accepts(&self, positional: usize, keywords: &[&str]) -> bool {
        if positional > self.required + self.optional && !self.has_varargs {
            return false;
        }
        if keywords
            .iter()
            .any(|kw| !self.keyword_names.iter().any(|name| &**name == *kw))
        {
            return false;
        }
        positional + keywords.len() >= self.required
    }
}

/// Candidate signatures for a multiply-registered callable, built once at
/// registration time. Selection is a pure scan over the table in registration
/// order; nothing is reflected over per call.
#[derive(Debug, Default)]
pub struct OverloadTable {
    candidates: Vec<OverloadSig>,
}

impl OverloadTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, sig: OverloadSig) -> usize {
        self.candidates.push(sig);
        self.candidates.len() - 1
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Index of the first registered candidate accepting the call shape.
    pub fn select(&self, positional: usize, keywords: &[&str]) -> Option<usize> {
        self.candidates
            .iter()
            .position(|sig| sig.accepts(positional, keywords))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::interner::intern;

    fn sig(
        params: &[&str],
        defaults: Vec<Value>,
        varargs: bool,
        kwonly: &[(&str, Option<Value>)],
    ) -> CodeObject {
        let mut varnames: Vec<Arc<str>> = params.iter().map(|p| intern(p)).collect();
        if varargs {
            varnames.push(intern("rest"));
        }
        let mut kw_defaults = FxHashMap::default();
        for (name, default) in kwonly {
            varnames.push(intern(name));
            if let Some(value) = default {
                kw_defaults.insert(intern(name), value.clone());
            }
        }
        CodeObject {
            name: "f".to_string(),
            qualname: "f".to_string(),
            file: "test.si".to_string(),
            code: Box::default(),
            spans: Box::default(),
            constants: Vec::new(),
            names: Vec::new(),
            varnames,
            arg_count: params.len(),
            has_varargs: varargs,
            kwonly_count: kwonly.len(),
            defaults,
            kw_defaults,
        }
    }

    fn kw(pairs: &[(&str, Value)]) -> FxHashMap<Arc<str>, Value> {
        pairs
            .iter()
            .map(|(name, value)| (intern(name), value.clone()))
            .collect()
    }

    #[test]
    fn positional_arguments_fill_slots_in_order() {
        let co = sig(&["x", "y"], vec![], false, &[]);
        let slots = bind(&co, &[Value::Int(1), Value::Int(2)], None).unwrap();
        assert_eq!(slots, vec![Value::Int(1), Value::Int(2)]);
    }

    #[test]
    fn missing_required_argument_is_named() {
        let co = sig(&["x", "y"], vec![], false, &[]);
        let err = bind(&co, &[Value::Int(1)], None).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::TypeError);
        assert!(err.message.contains("missing 1 required positional argument: 'y'"));
    }

    #[test]
    fn several_missing_names_join_with_an_oxford_comma() {
        let co = sig(&["x", "y", "z"], vec![], false, &[]);
        // An unrelated keyword routes through the override state, which
        // collects every unmet name before failing.
        let err = bind(&co, &[], Some(&kw(&[("q", Value::Int(0))]))).unwrap_err();
        assert!(err.message.contains("'x', 'y', and 'z'"), "{}", err.message);

        let co = sig(&["x", "y"], vec![], false, &[]);
        let err = bind(&co, &[], Some(&kw(&[("q", Value::Int(0))]))).unwrap_err();
        assert!(err.message.contains("'x' and 'y'"));
    }

    #[test]
    fn defaults_fill_unsupplied_trailing_slots() {
        let co = sig(&["x", "y"], vec![Value::Int(10)], false, &[]);
        let slots = bind(&co, &[Value::Int(5)], None).unwrap();
        assert_eq!(slots, vec![Value::Int(5), Value::Int(10)]);
    }

    #[test]
    fn keyword_wins_over_default() {
        let co = sig(&["x", "y"], vec![Value::Int(10)], false, &[]);
        let slots = bind(&co, &[Value::Int(5)], Some(&kw(&[("y", Value::Int(99))]))).unwrap();
        assert_eq!(slots, vec![Value::Int(5), Value::Int(99)]);
    }

    #[test]
    fn keyword_can_supply_a_required_slot() {
        let co = sig(&["x", "y"], vec![], false, &[]);
        let slots = bind(
            &co,
            &[Value::Int(1)],
            Some(&kw(&[("y", Value::Int(2))])),
        )
        .unwrap();
        assert_eq!(slots, vec![Value::Int(1), Value::Int(2)]);
    }

    #[test]
    fn leftover_positionals_become_the_varargs_tuple() {
        let co = sig(&["x"], vec![], true, &[]);
        let slots = bind(
            &co,
            &[Value::Int(1), Value::Int(2), Value::Int(3), Value::Int(4)],
            None,
        )
        .unwrap();
        assert_eq!(slots.len(), 2);
        assert_eq!(slots[0], Value::Int(1));
        assert_eq!(
            slots[1],
            Value::tuple(vec![Value::Int(2), Value::Int(3), Value::Int(4)])
        );
    }

    #[test]
    fn no_leftovers_still_bind_an_empty_tuple() {
        let co = sig(&["x"], vec![], true, &[]);
        let slots = bind(&co, &[Value::Int(1)], None).unwrap();
        assert_eq!(slots, vec![Value::Int(1), Value::empty_tuple()]);
    }

    #[test]
    fn surplus_positionals_without_varargs_are_an_arity_error() {
        let co = sig(&["x"], vec![], false, &[]);
        let err = bind(&co, &[Value::Int(1), Value::Int(2)], None).unwrap_err();
        assert!(err.message.contains("takes 1 positional argument but 2 were given"));

        let co = sig(&[], vec![], false, &[]);
        let err = bind(&co, &[Value::Int(1)], None).unwrap_err();
        assert!(err.message.contains("takes 0"));
    }

    #[test]
    fn keyword_only_slots_prefer_the_call_site() {
        let co = sig(
            &["x"],
            vec![],
            true,
            &[("flag", Some(Value::Bool(false)))],
        );
        let slots = bind(
            &co,
            &[Value::Int(1)],
            Some(&kw(&[("flag", Value::Bool(true))])),
        )
        .unwrap();
        assert_eq!(
            slots,
            vec![Value::Int(1), Value::empty_tuple(), Value::Bool(true)]
        );

        let slots = bind(&co, &[Value::Int(1)], None).unwrap();
        assert_eq!(
            slots,
            vec![Value::Int(1), Value::empty_tuple(), Value::Bool(false)]
        );
    }

    #[test]
    fn keyword_only_without_default_or_keyword_fails() {
        let co = sig(&["x"], vec![], true, &[("flag", None)]);
        let err = bind(&co, &[Value::Int(1)], None).unwrap_err();
        assert!(err.message.contains("keyword-only argument: 'flag'"));
    }

    #[test]
    fn unknown_keywords_are_ignored() {
        let co = sig(&["x"], vec![], false, &[]);
        let slots = bind(
            &co,
            &[Value::Int(1)],
            Some(&kw(&[("mystery", Value::Int(9))])),
        )
        .unwrap();
        assert_eq!(slots, vec![Value::Int(1)]);
    }

    #[test]
    fn every_valid_call_fills_every_slot_exactly_once() {
        let co = sig(
            &["a", "b", "c"],
            vec![Value::Int(30)],
            true,
            &[("k", Some(Value::Int(40)))],
        );
        let slots = bind(
            &co,
            &[Value::Int(1), Value::Int(2)],
            Some(&kw(&[("c", Value::Int(3))])),
        )
        .unwrap();
        // positional a, b; keyword c; empty varargs; defaulted kwonly.
        assert_eq!(
            slots,
            vec![
                Value::Int(1),
                Value::Int(2),
                Value::Int(3),
                Value::empty_tuple(),
                Value::Int(40)
            ]
        );
    }

    #[test]
    fn zero_parameter_call_binds_nothing() {
        let co = sig(&[], vec![], false, &[]);
        assert_eq!(bind(&co, &[], None).unwrap(), Vec::<Value>::new());
    }

    #[test]
    fn overload_table_selects_by_shape_in_registration_order() {
        let mut table = OverloadTable::new();
        let unary = table.register(OverloadSig {
            required: 1,
            optional: 0,
            has_varargs: false,
            keyword_names: vec![intern("x")],
        });
        let binary = table.register(OverloadSig {
            required: 2,
            optional: 0,
            has_varargs: false,
            keyword_names: vec![intern("x"), intern("y")],
        });
        let variadic = table.register(OverloadSig {
            required: 0,
            optional: 0,
            has_varargs: true,
            keyword_names: vec![],
        });

        assert_eq!(table.select(1, &[]), Some(unary));
        assert_eq!(table.select(2, &[]), Some(binary));
        assert_eq!(table.select(5, &[]), Some(variadic));
        assert_eq!(table.select(1, &["y"]), Some(binary));
        assert_eq!(table.select(0, &["mystery"]), Some(variadic));
    }

    #[test]
    fn overload_table_rejects_unmatchable_shapes() {
        let mut table = OverloadTable::new();
        table.register(OverloadSig {
            required: 2,
            optional: 0,
            has_varargs: false,
            keyword_names: vec![intern("x"), intern("y")],
        });
        assert_eq!(table.select(0, &[]), None);
        assert_eq!(table.select(1, &["z"]), None);
    }
}
