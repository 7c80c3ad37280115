//! Generator-style sequencing

/// Sequence effects without nesting `flat_map` closures
///
/// ```ignore
/// let program: Effect<u32, String> = effect! {
///     let a = bind fetch(1);
///     let b = bind fetch(2);
///     bind Effect::log(format!("got {} and {}", a, b));
///     let sum = a + b;
///     Effect::succeed(sum)
/// };
/// ```
///
/// `bind` statements become `flat_map` steps; captured values are moved
/// into each continuation, so they must be `Clone` if used after a later
/// `bind` in a continuation that may run more than once.
#[macro_export]
macro_rules! effect {
    (let $p:pat = bind $e:expr; $($rest:tt)+) => {
        $crate::Effect::flat_map($e, move |$p| { $crate::effect!($($rest)+) })
    };
    (bind $e:expr; $($rest:tt)+) => {
        $crate::Effect::flat_map($e, move |_| { $crate::effect!($($rest)+) })
    };
    (let $p:pat = $e:expr; $($rest:tt)+) => {{
        let $p = $e;
        $crate::effect!($($rest)+)
    }};
    ($e:expr) => {
        $e
    };
}
