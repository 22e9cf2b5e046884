mod helpers;
mod test_errors;
mod test_expressions;
mod test_programs;
