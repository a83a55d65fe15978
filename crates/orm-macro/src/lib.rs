//! Derive macro for `strata-orm` entities.

#![forbid(unsafe_code)]

mod attrs;
mod expand;

use proc_macro::TokenStream;
use syn::{DeriveInput, parse_macro_input};

/// Derives `strata_orm::Entity` from table, column and relation attributes.
///
/// # Example
///
/// ```rust,ignore
/// #[derive(Debug, Default, Clone, Entity)]
/// #[table(name = "t_student", soft_delete_table = "t_student_del")]
/// pub struct Student {
///     #[column(key, auto_increment)]
///     pub id: Option<i64>,
///     pub name: Option<String>,
///     #[column(cas_version)]
///     pub version: Option<i32>,
///     #[column(soft_delete)]
///     pub deleted: Option<bool>,
///     #[column(json)]
///     pub tags: Option<Vec<String>>,
///     #[column(computed = "(SELECT COUNT(*) FROM t_course c WHERE c.student_id = t_student.id)")]
///     pub course_count: Option<i64>,
///     #[relation(local = "id", remote = "student_id")]
///     pub courses: Option<Vec<Course>>,
/// }
///
/// #[derive(Debug, Default, Entity)]
/// #[join(kind = "left", on = "t1.school_id = t2.id")]
/// pub struct StudentSchool {
///     #[join_left]
///     pub student: Option<Student>,
///     #[join_right]
///     pub school: Option<School>,
/// }
/// ```
#[proc_macro_derive(Entity, attributes(table, column, relation, join, join_left, join_right))]
pub fn derive_entity(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    expand::expand(&input).unwrap_or_else(syn::Error::into_compile_error).into()
}
