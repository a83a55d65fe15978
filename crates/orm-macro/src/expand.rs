use proc_macro2::TokenStream;
use quote::{format_ident, quote};
use syn::{
    Data, DeriveInput, Fields, GenericArgument, Ident, LitStr, PathArguments, Result, Type,
};

use crate::attrs::{ColumnAttrs, EntityAttrs, FieldKind, JoinKind, RelationAttrs};

struct Column<'a> {
    ident: &'a Ident,
    attrs: ColumnAttrs,
}

struct Relation<'a> {
    ident: &'a Ident,
    attrs: RelationAttrs,
    remote: &'a Type,
    many: bool,
}

struct Side<'a> {
    ident: &'a Ident,
    ty: &'a Type,
}

pub fn expand(input: &DeriveInput) -> Result<TokenStream> {
    if !input.generics.params.is_empty() {
        return Err(syn::Error::new_spanned(&input.generics, "entities cannot be generic"));
    }
    let Data::Struct(data) = &input.data else {
        return Err(syn::Error::new_spanned(input, "Entity can only be derived for structs"));
    };
    let Fields::Named(fields) = &data.fields else {
        return Err(syn::Error::new_spanned(input, "Entity requires named fields"));
    };

    let entity = EntityAttrs::from_attrs(&input.attrs)?;

    let mut columns = Vec::new();
    let mut relations = Vec::new();
    let mut left = None;
    let mut right = None;

    for field in &fields.named {
        let Some(ident) = field.ident.as_ref() else { continue };
        match FieldKind::from_field(field)? {
            FieldKind::Column(attrs) => columns.push(Column { ident, attrs }),
            FieldKind::Relation(attrs) => {
                let (remote, many) = relation_target(&field.ty)?;
                relations.push(Relation { ident, attrs, remote, many });
            }
            FieldKind::JoinLeft => left = Some(Side { ident, ty: option_inner(&field.ty)? }),
            FieldKind::JoinRight => right = Some(Side { ident, ty: option_inner(&field.ty)? }),
            FieldKind::Skip => {}
        }
    }

    if entity.join.is_some() {
        if let Some(relation) = relations.first() {
            return Err(syn::Error::new_spanned(
                relation.ident,
                "join projections resolve relations through their sides",
            ));
        }
        if left.is_none() || right.is_none() {
            return Err(syn::Error::new_spanned(
                &input.ident,
                "join projections need one #[join_left] and one #[join_right] field",
            ));
        }
    } else if entity.table.is_none() {
        return Err(syn::Error::new_spanned(&input.ident, "missing #[table(name = \"...\")]"));
    }

    let ident = &input.ident;
    let describe = describe(ident, &entity, &columns, &relations, left.as_ref().zip(right.as_ref()));
    let column_value = column_value(ident, &columns);
    let set_column = set_column(ident, &columns);
    let relation_handlers = relation_handlers(ident, &relations, left.as_ref().zip(right.as_ref()));
    let map_join_row = left.as_ref().zip(right.as_ref()).map(|(left, right)| map_join_row(left, right));

    Ok(quote! {
        impl ::strata_orm::Entity for #ident {
            #describe
            #column_value
            #set_column
            #relation_handlers
            #map_join_row
        }
    })
}

fn describe(
    ident: &Ident, entity: &EntityAttrs, columns: &[Column], relations: &[Relation],
    sides: Option<(&Side, &Side)>,
) -> TokenStream {
    let name = ident.to_string();
    let table = entity.table.as_ref().map_or_else(String::new, LitStr::value);
    let soft_delete_table = optional(entity.soft_delete_table.as_ref());

    let columns = columns.iter().map(|column| {
        let name = column_name(column);
        let field = unraw(column.ident);
        let ColumnAttrs { key, auto_increment, json, cas_version, insertable, updatable, .. } =
            column.attrs;
        let soft_delete = column.attrs.soft_delete.as_ref().map_or_else(
            || quote!(None),
            |(normal, deleted)| quote!(Some((#normal, #deleted))),
        );
        let computed = optional(column.attrs.computed.as_ref());
        quote! {
            ::strata_orm::ColumnSpec {
                key: #key,
                auto_increment: #auto_increment,
                json: #json,
                cas_version: #cas_version,
                soft_delete: #soft_delete,
                computed: #computed,
                insertable: #insertable,
                updatable: #updatable,
                ..::strata_orm::ColumnSpec::new(#name, #field)
            }
        }
    });

    let relations = relations.iter().map(|relation| {
        let field = unraw(relation.ident);
        let local = &relation.attrs.local;
        let remote_column = &relation.attrs.remote;
        let remote = relation.remote;
        let extra_where = optional(relation.attrs.extra_where.as_ref());
        let provider = relation.attrs.provider.is_some();
        let cardinality = if relation.many { quote!(Many) } else { quote!(One) };
        quote! {
            ::strata_orm::RelationSpec {
                field: #field,
                local_column: #local,
                remote_column: #remote_column,
                remote: ::strata_orm::meta::<#remote>,
                extra_where: #extra_where,
                provider: #provider,
                cardinality: ::strata_orm::Cardinality::#cardinality,
            }
        }
    });

    let join = match (&entity.join, sides) {
        (Some(join), Some((left, right))) => {
            let kind = match join.kind {
                JoinKind::Join => quote!(Join),
                JoinKind::Left => quote!(Left),
                JoinKind::Right => quote!(Right),
                JoinKind::Straight => quote!(Straight),
            };
            let on = &join.on;
            let left_field = unraw(left.ident);
            let right_field = unraw(right.ident);
            let (left_ty, right_ty) = (left.ty, right.ty);
            quote! {
                Some(::strata_orm::JoinSpec {
                    kind: ::strata_orm::JoinKind::#kind,
                    on: #on,
                    left_field: #left_field,
                    right_field: #right_field,
                    left: ::strata_orm::meta::<#left_ty>,
                    right: ::strata_orm::meta::<#right_ty>,
                })
            }
        }
        _ => quote!(None),
    };

    quote! {
        fn describe() -> ::strata_orm::EntityMeta {
            ::strata_orm::EntityMeta {
                name: #name,
                type_id: ::std::any::TypeId::of::<Self>(),
                table: #table,
                soft_delete_table: #soft_delete_table,
                columns: ::std::vec![#(#columns),*],
                relations: ::std::vec![#(#relations),*],
                join: #join,
            }
        }
    }
}

fn column_value(ident: &Ident, columns: &[Column]) -> TokenStream {
    let name = ident.to_string();
    let arms = columns.iter().map(|column| {
        let column_name = column_name(column);
        let field = column.ident;
        if column.attrs.json {
            quote! {
                if column.eq_ignore_ascii_case(#column_name) {
                    return ::strata_orm::__private::json_to_column(#column_name, &self.#field);
                }
            }
        } else {
            quote! {
                if column.eq_ignore_ascii_case(#column_name) {
                    return Ok(::strata_orm::ToColumn::to_column(&self.#field));
                }
            }
        }
    });

    quote! {
        fn column_value(
            &self, column: &str,
        ) -> ::strata_orm::Result<Option<::strata_orm::__private::Value>> {
            #(#arms)*
            Err(::strata_orm::Error::UnknownColumn { entity: #name, column: column.to_string() })
        }
    }
}

fn set_column(ident: &Ident, columns: &[Column]) -> TokenStream {
    let name = ident.to_string();
    let arms = columns.iter().map(|column| {
        let column_name = column_name(column);
        let field = column.ident;
        let fetch = if column.attrs.json {
            quote!(::strata_orm::__private::json_from_column(#column_name, value)?)
        } else {
            quote!(::strata_orm::__private::fetch_column(#column_name, value)?)
        };
        quote! {
            if column.eq_ignore_ascii_case(#column_name) {
                self.#field = #fetch;
                return Ok(());
            }
        }
    });

    quote! {
        #[allow(unused_variables)]
        fn set_column(
            &mut self, column: &str, value: &::strata_orm::DataType,
        ) -> ::strata_orm::Result<()> {
            #(#arms)*
            Err(::strata_orm::Error::UnknownColumn { entity: #name, column: column.to_string() })
        }
    }
}

fn relation_handlers(
    ident: &Ident, relations: &[Relation], sides: Option<(&Side, &Side)>,
) -> TokenStream {
    let mut slots = Vec::new();
    let mut handlers = Vec::new();

    for relation in relations {
        let field = relation.ident;
        let field_name = unraw(field);
        let slot = format_ident!("__strata_{}", field_name);
        let remote = relation.remote;
        let (handler, slot_ty) = if relation.many {
            (quote!(::strata_orm::Many::<#ident, #remote>), quote!(Option<::std::vec::Vec<#remote>>))
        } else {
            (quote!(::strata_orm::One::<#ident, #remote>), quote!(Option<#remote>))
        };
        slots.push(quote! {
            fn #slot(entity: &mut #ident) -> &mut #slot_ty {
                &mut entity.#field
            }
        });
        handlers.push(relation.attrs.provider.as_ref().map_or_else(
            || quote!(#handler::new(#field_name, #slot)),
            |provider| {
                quote!(#handler::with_provider(
                    #field_name,
                    #slot,
                    <#provider as ::std::default::Default>::default(),
                ))
            },
        ));
    }

    if let Some((left, right)) = sides {
        for side in [left, right] {
            let field = side.ident;
            let field_name = unraw(field);
            let slot = format_ident!("__strata_{}", field_name);
            let ty = side.ty;
            slots.push(quote! {
                fn #slot(entity: &mut #ident) -> &mut Option<#ty> {
                    &mut entity.#field
                }
            });
            handlers.push(quote!(::strata_orm::JoinSide::<#ident, #ty>::new(#field_name, #slot)));
        }
    }

    if handlers.is_empty() {
        return TokenStream::new();
    }

    // handlers (and their providers) are built once per entity type
    quote! {
        fn relations() -> ::std::vec::Vec<::std::sync::Arc<dyn ::strata_orm::Relation<Self>>> {
            #(#slots)*
            static HANDLERS: ::std::sync::LazyLock<
                ::std::vec::Vec<::std::sync::Arc<dyn ::strata_orm::Relation<#ident>>>,
            > = ::std::sync::LazyLock::new(|| {
                ::std::vec![#(::std::sync::Arc::new(#handlers) as ::std::sync::Arc<dyn ::strata_orm::Relation<#ident>>),*]
            });
            HANDLERS.clone()
        }
    }
}

fn map_join_row(left: &Side, right: &Side) -> TokenStream {
    let (left_field, left_ty) = (left.ident, left.ty);
    let (right_field, right_ty) = (right.ident, right.ty);
    quote! {
        fn map_join_row(row: &::strata_orm::Row, strict: bool) -> ::strata_orm::Result<Self> {
            Ok(Self {
                #left_field: ::strata_orm::__private::map_side::<#left_ty>(
                    row, ::strata_orm::LEFT_ALIAS, strict,
                )?,
                #right_field: ::strata_orm::__private::map_side::<#right_ty>(
                    row, ::strata_orm::RIGHT_ALIAS, strict,
                )?,
                ..::std::default::Default::default()
            })
        }
    }
}

fn column_name(column: &Column) -> LitStr {
    column
        .attrs
        .name
        .clone()
        .unwrap_or_else(|| LitStr::new(&unraw(column.ident), column.ident.span()))
}

fn unraw(ident: &Ident) -> String {
    let name = ident.to_string();
    name.strip_prefix("r#").map_or_else(|| name.clone(), ToString::to_string)
}

fn optional(lit: Option<&LitStr>) -> TokenStream {
    lit.map_or_else(|| quote!(None), |lit| quote!(Some(#lit)))
}

/// `Option<Vec<R>>` is a collection relation, `Option<R>` a singular one.
fn relation_target(ty: &Type) -> Result<(&Type, bool)> {
    let inner = option_inner(ty)?;
    Ok(generic_inner(inner, "Vec").map_or((inner, false), |remote| (remote, true)))
}

fn option_inner(ty: &Type) -> Result<&Type> {
    generic_inner(ty, "Option").ok_or_else(|| syn::Error::new_spanned(ty, "expected an `Option<...>` field"))
}

fn generic_inner<'a>(ty: &'a Type, wrapper: &str) -> Option<&'a Type> {
    let Type::Path(path) = ty else { return None };
    let segment = path.path.segments.last()?;
    if segment.ident != wrapper {
        return None;
    }
    let PathArguments::AngleBracketed(args) = &segment.arguments else { return None };
    match args.args.first()? {
        GenericArgument::Type(inner) => Some(inner),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use syn::parse_quote;

    use super::*;

    #[test]
    fn relation_cardinality() {
        let ty: Type = parse_quote!(Option<Vec<Course>>);
        let (remote, many) = relation_target(&ty).unwrap();
        assert!(many);
        assert_eq!(quote!(#remote).to_string(), "Course");

        let ty: Type = parse_quote!(Option<School>);
        let (remote, many) = relation_target(&ty).unwrap();
        assert!(!many);
        assert_eq!(quote!(#remote).to_string(), "School");

        let ty: Type = parse_quote!(Vec<Course>);
        assert!(relation_target(&ty).is_err());
    }

    #[test]
    fn plain_entity() {
        let input: DeriveInput = parse_quote! {
            #[table(name = "t_student")]
            struct Student {
                #[column(key, auto_increment)]
                id: Option<i64>,
                #[column(name = "student_name")]
                name: Option<String>,
                #[relation(local = "id", remote = "student_id")]
                courses: Option<Vec<Course>>,
            }
        };
        let tokens = expand(&input).unwrap().to_string();
        assert!(tokens.contains("\"t_student\""));
        assert!(tokens.contains("\"student_name\""));
        assert!(tokens.contains("Many :: < Student , Course >"));
        assert!(tokens.contains("static HANDLERS"));
        assert!(tokens.contains("fn __strata_courses"));
        assert!(!tokens.contains("map_join_row"));
    }

    #[test]
    fn join_entity() {
        let input: DeriveInput = parse_quote! {
            #[join(kind = "left", on = "t1.school_id = t2.id")]
            struct StudentSchool {
                #[join_left]
                student: Option<Student>,
                #[join_right]
                school: Option<School>,
            }
        };
        let tokens = expand(&input).unwrap().to_string();
        assert!(tokens.contains("JoinKind :: Left"));
        assert!(tokens.contains("map_side :: < School >"));
        assert!(tokens.contains("JoinSide :: < StudentSchool , Student >"));
    }

    #[test]
    fn rejected_shapes() {
        let missing_table: DeriveInput = parse_quote!(struct Student { id: Option<i64> });
        assert!(expand(&missing_table).is_err());

        let generic: DeriveInput = parse_quote! {
            #[table(name = "t")]
            struct Wrapper<T> { id: Option<T> }
        };
        assert!(expand(&generic).is_err());

        let one_sided: DeriveInput = parse_quote! {
            #[join(on = "t1.a = t2.b")]
            struct Half {
                #[join_left]
                left: Option<Student>,
            }
        };
        assert!(expand(&one_sided).is_err());
    }

    #[test]
    fn raw_identifiers() {
        let ident: Ident = parse_quote!(r#type);
        assert_eq!(unraw(&ident), "type");
    }
}
