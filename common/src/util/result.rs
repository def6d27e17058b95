use std::fmt::Debug;

pub trait TapErr<E> {
    fn tap_err(self, f: impl FnOnce(&E)) -> Self;
}

impl<T, E: Debug> TapErr<E> for Result<T, E> {
    #[inline]
    fn tap_err(self, f: impl FnOnce(&E)) -> Self {
        if let Err(e) = &self {
            f(e);
        }
        self
    }
}
