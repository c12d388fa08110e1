use error::ExecError;

/// A Result is an alias of [std::result::Result](std::result::Result) with its error variant
/// pre-populated with a `Box<dyn ExecError>`. This allows for shorter
/// notation throughout the codebase.
///
/// For example, instead of writing...
///
/// ```
/// use error::ExecError;
///
/// fn greet() -> Result<&'static str, Box<dyn ExecError>> {
///     Ok("Hello, executor!")
/// }
/// ```
///
/// ...you can simply say...
///
/// ```
/// use error::ExecError;
/// use result::Result;
///
/// fn greet() -> Result<&'static str> {
///     Ok("Hello, executor!")
/// }
/// ```
///
/// It also helps in easily identifying if any functions are returning errors
/// BEFORE converting them into project native [ExecError](error::ExecError)s.
pub type Result<T> = std::result::Result<T, Box<dyn ExecError>>;
