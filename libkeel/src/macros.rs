macro_rules! ensure_eq {
    ($a:expr, $b:expr) => {
        ensure!($a == $b, "expected `{:?}` to equal `{:?}`", $a, $b)
    };
    ($a:expr, $b:expr, $($args:tt)*) => {
        ensure!($a == $b, $($args)*)
    };
}

macro_rules! bug {
    ($($args:tt)*) => {
        panic!($($args)*)
    };
}
