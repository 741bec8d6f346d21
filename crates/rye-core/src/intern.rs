use std::cell::RefCell;

use lasso::Rodeo;
pub use lasso::Spur;

thread_local! {
    static INTERNER: RefCell<Rodeo> = RefCell::new(Rodeo::default());
}

/// Intern a string, returning a Spur key.
pub fn intern(s: &str) -> Spur {
    INTERNER.with(|r| r.borrow_mut().get_or_intern(s))
}

/// Resolve a Spur key back to a String.
pub fn resolve(spur: Spur) -> String {
    INTERNER.with(|r| r.borrow().resolve(&spur).to_string())
}

/// Resolve a Spur and call f with the &str, avoiding allocation.
pub fn with_resolved<F, R>(spur: Spur, f: F) -> R
where
    F: FnOnce(&str) -> R,
{
    INTERNER.with(|r| {
        let interner = r.borrow();
        f(interner.resolve(&spur))
    })
}

/// If `spur` names a variadic positional reference (`..1`, `..2`, ...),
/// return its one-based index.
pub fn ddval(spur: Spur) -> Option<usize> {
    with_resolved(spur, |s| {
        let rest = s.strip_prefix("..")?;
        if rest.is_empty() || !rest.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        rest.parse().ok()
    })
}

/// Symbols the compiler and interpreter match against by key.
/// Interned lazily per thread alongside the interner itself.
pub mod sym {
    use super::{intern, Spur};

    macro_rules! well_known {
        ($($fn_name:ident => $text:literal),+ $(,)?) => {
            $(pub fn $fn_name() -> Spur { intern($text) })+
        };
    }

    well_known! {
        assign => "<-",
        superassign => "<<-",
        and => "&&",
        or => "||",
        quote => "quote",
        if_ => "if",
        while_ => "while",
        repeat_ => "repeat",
        for_ => "for",
        next_ => "next",
        break_ => "break",
        return_ => "return",
        function => "function",
        block => "{",
        paren => "(",
        bracket => "[",
        double_bracket => "[[",
        dollar => "$",
        add => "+",
        sub => "-",
        mul => "*",
        div => "/",
        lt => "<",
        gt => ">",
        eq => "==",
        colon => ":",
        is_null => "is.null",
        is_list => "is.list",
        is_pairlist => "is.pairlist",
        dots => "...",
        value => "value",
        class => "class",
        names => "names",
        getter_placeholder => "*.placeholder.getter.*",
        setter_placeholder => "*.placeholder.setter.*",
    }

    /// The setter selector for an accessor: `f` becomes `f<-`.
    pub fn setter_for(getter: Spur) -> Spur {
        let mut name = super::resolve(getter);
        name.push_str("<-");
        intern(&name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_round_trip() {
        let k = intern("hello");
        assert_eq!(resolve(k), "hello");
        assert_eq!(intern("hello"), k);
    }

    #[test]
    fn test_ddval() {
        assert_eq!(ddval(intern("..1")), Some(1));
        assert_eq!(ddval(intern("..42")), Some(42));
        assert_eq!(ddval(intern("..")), None);
        assert_eq!(ddval(intern("x")), None);
        assert_eq!(ddval(intern("..x")), None);
    }

    #[test]
    fn test_setter_for() {
        assert_eq!(sym::setter_for(intern("dim")), intern("dim<-"));
    }
}
