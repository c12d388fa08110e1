use k8s_openapi::api::core::v1::{Event as ClusterEvent, Node, Pod};
pub use kind_derive::*;

/// A type that implements Kind is capable of describing itself to outside systems,
/// typically by simply returning the name of their type.
///
/// Within the executor this is what keys prometheus counters and log entries. For
/// example, every error counted by the task manager is labeled with the `kind()`
/// of the error that the task returned, and every reported lifecycle event is
/// counted under the `kind()` of its variant.
///
/// This is most easily accomplished by using the Kind derive macro.
///
/// ```
/// use kind::Kind;
///
/// #[derive(Kind)]
/// struct MyKind {}
///
/// #[derive(Kind)]
/// enum MyEnum {
///     VariantOne,
///     VariantTwo(u32)
/// }
///
/// assert_eq!("MyKind", MyKind{}.kind());
/// assert_eq!("MyEnum::VariantOne", MyEnum::VariantOne.kind());
/// assert_eq!("MyEnum::VariantTwo", MyEnum::VariantTwo(42).kind());
/// ```
///
/// The Kind derivation macro does not work on Unions. If you wish, you must
/// implement Kind on your target Union yourself.
///
/// A blanket implementation exists for all [Vec<T>](std::vec::Vec) where T
/// implements Kind for which the result is `List[T::kind()]`. If the vector is
/// empty, then the kind is `List[]`.
pub trait Kind {
    fn kind(&self) -> String;
}

macro_rules! impl_kind {
    ($i:ident) => {
        impl Kind for $i {
            fn kind(&self) -> String {
                stringify!($i).to_string()
            }
        }
    };
    (()) => {
        impl Kind for () {
            fn kind(&self) -> String {
                stringify!(()).to_string()
            }
        }
    };
}

impl_kind!(());
impl_kind!(String);
impl_kind!(Pod);
impl_kind!(Node);
impl_kind!(ClusterEvent);

impl<T> Kind for Vec<T>
where
    T: Kind,
{
    fn kind(&self) -> String {
        if self.is_empty() {
            "List[]".to_string()
        } else {
            format!("List[{}]", self.get(0).unwrap().kind())
        }
    }
}

impl<T> Kind for Option<T>
where
    T: Kind,
{
    fn kind(&self) -> String {
        match self {
            None => "None".to_string(),
            Some(inner) => inner.kind(),
        }
    }
}
