//! Macros for reducing composite-action boilerplate.

/// Build a serial [`CompositeAction`](crate::CompositeAction) from a list of
/// children.
///
/// Each child may be a domain action or another composite; both are
/// converted with `Dispatchable::from`. The result is a plain
/// `CompositeAction`, so the usual builder methods chain on it.
///
/// # Example
///
/// ```ignore
/// use dataflow_core::composite;
///
/// let checkout = composite![
///     Cart::Lock,
///     composite![Payment::Authorize, Payment::Capture],
///     Cart::Clear,
/// ]
/// .with_fallback(Cart::Unlock);
///
/// store.dispatch(checkout)?;
/// ```
#[macro_export]
macro_rules! composite {
    () => {
        $crate::CompositeAction::new(::std::vec::Vec::<$crate::Dispatchable<_>>::new())
    };
    ($($child:expr),+ $(,)?) => {
        $crate::CompositeAction::new(::std::vec![$($crate::Dispatchable::from($child)),+])
    };
}

#[cfg(test)]
mod tests {
    use crate::{Action, CompositeAction, Dispatchable};

    #[derive(Debug, Clone, PartialEq)]
    enum Step {
        One,
        Two,
        Three,
    }

    impl Action for Step {}

    #[test]
    fn test_composite_macro_keeps_order() {
        let composite: CompositeAction<Step> = composite![Step::One, Step::Two, Step::Three];

        let children: Vec<&Step> = composite
            .children()
            .iter()
            .filter_map(Dispatchable::as_simple)
            .collect();
        assert_eq!(children, vec![&Step::One, &Step::Two, &Step::Three]);
        assert!(composite.is_serial());
    }

    #[test]
    fn test_composite_macro_nests() {
        let composite: CompositeAction<Step> =
            composite![Step::One, composite![Step::Two, Step::Three],];

        assert_eq!(composite.children().len(), 2);
        assert!(matches!(composite.children()[1], Dispatchable::Composite(_)));
    }

    #[test]
    fn test_composite_macro_chains_builders() {
        let composite: CompositeAction<Step> =
            composite![Step::One].with_fallback(Step::Three).concurrent();

        assert!(!composite.is_serial());
        assert!(composite.fallback().is_some());
    }

    #[test]
    fn test_empty_composite_macro() {
        let composite: CompositeAction<Step> = composite![];
        assert!(composite.children().is_empty());
    }
}
