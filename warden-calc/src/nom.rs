//! Shared `nom` helpers for the expression parser.

use nom::{
    combinator::all_consuming,
    error::{ContextError, VerboseError},
};

pub type IResult<I, O, E = VerboseError<I>> = Result<(I, O), nom::Err<E>>;

pub fn parse_error<'a>(i: &'a str, context: &'static str) -> nom::Err<VerboseError<&'a str>> {
    let err = VerboseError { errors: Vec::new() };
    let err = VerboseError::add_context(i, context, err);
    nom::Err::Error(err)
}

/// Parse complete input, generate a simple one-line error message.
pub fn parse_complete_line<'a, F, O>(
    what: &str,
    i: &'a str,
    parser: F,
) -> Result<O, String>
where
    F: FnMut(&'a str) -> IResult<&'a str, O>,
{
    match all_consuming(parser)(i) {
        Err(nom::Err::Error(VerboseError { errors }))
        | Err(nom::Err::Failure(VerboseError { errors })) => {
            if errors.is_empty() {
                Err(format!("unable to parse {}", what))
            } else {
                Err(format!(
                    "unable to parse {} at '{}' - {:?}",
                    what, errors[0].0, errors[0].1
                ))
            }
        }
        Err(err) => Err(format!("unable to parse {} - {}", what, err)),
        Ok((_, data)) => Ok(data),
    }
}
