use syn::meta::ParseNestedMeta;
use syn::parse::Result;
use syn::spanned::Spanned;
use syn::{Attribute, Field, LitBool, LitStr, Path, token};

/// Struct-level attributes: `#[table(...)]` and `#[join(...)]`.
#[derive(Default)]
pub struct EntityAttrs {
    pub table: Option<LitStr>,
    pub soft_delete_table: Option<LitStr>,
    pub join: Option<JoinAttrs>,
}

pub struct JoinAttrs {
    pub kind: JoinKind,
    pub on: LitStr,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinKind {
    Join,
    Left,
    Right,
    Straight,
}

/// What a struct field maps to.
pub enum FieldKind {
    Column(ColumnAttrs),
    Relation(RelationAttrs),
    JoinLeft,
    JoinRight,
    Skip,
}

pub struct ColumnAttrs {
    pub name: Option<LitStr>,
    pub key: bool,
    pub auto_increment: bool,
    pub json: bool,
    pub cas_version: bool,
    pub soft_delete: Option<(LitStr, LitStr)>,
    pub computed: Option<LitStr>,
    pub insertable: bool,
    pub updatable: bool,
    pub skip: bool,
}

impl Default for ColumnAttrs {
    fn default() -> Self {
        Self {
            name: None,
            key: false,
            auto_increment: false,
            json: false,
            cas_version: false,
            soft_delete: None,
            computed: None,
            insertable: true,
            updatable: true,
            skip: false,
        }
    }
}

#[derive(Default)]
pub struct RelationAttrs {
    pub local: Option<LitStr>,
    pub remote: Option<LitStr>,
    pub extra_where: Option<LitStr>,
    pub provider: Option<Path>,
}

impl EntityAttrs {
    pub fn from_attrs(attrs: &[Attribute]) -> Result<Self> {
        let mut parsed = Self::default();

        for attr in attrs {
            if attr.path().is_ident("table") {
                attr.parse_nested_meta(|meta| parsed.parse_table(&meta))?;
            } else if attr.path().is_ident("join") {
                let mut kind = None;
                let mut on = None;
                attr.parse_nested_meta(|meta| {
                    if meta.path.is_ident("kind") {
                        let lit: LitStr = meta.value()?.parse()?;
                        kind = Some(join_kind(&lit)?);
                    } else if meta.path.is_ident("on") {
                        on = Some(meta.value()?.parse()?);
                    } else {
                        return Err(meta.error("unsupported join property"));
                    }
                    Ok(())
                })?;
                let Some(on) = on else {
                    return Err(syn::Error::new_spanned(attr, "missing `on` condition"));
                };
                parsed.join = Some(JoinAttrs {
                    kind: kind.unwrap_or(JoinKind::Join),
                    on,
                });
            }
        }

        Ok(parsed)
    }

    fn parse_table(&mut self, meta: &ParseNestedMeta) -> Result<()> {
        if meta.path.is_ident("name") {
            self.table = Some(meta.value()?.parse()?);
        } else if meta.path.is_ident("soft_delete_table") {
            self.soft_delete_table = Some(meta.value()?.parse()?);
        } else {
            return Err(meta.error("unsupported table property"));
        }
        Ok(())
    }
}

fn join_kind(lit: &LitStr) -> Result<JoinKind> {
    match lit.value().to_ascii_lowercase().as_str() {
        "join" | "inner" => Ok(JoinKind::Join),
        "left" => Ok(JoinKind::Left),
        "right" => Ok(JoinKind::Right),
        "straight" | "straight_join" => Ok(JoinKind::Straight),
        _ => Err(syn::Error::new(lit.span(), "expected one of: join, left, right, straight")),
    }
}

impl FieldKind {
    pub fn from_field(field: &Field) -> Result<Self> {
        let mut kind = None;

        for attr in &field.attrs {
            let parsed = if attr.path().is_ident("column") {
                let mut column = ColumnAttrs::default();
                if matches!(attr.meta, syn::Meta::List(_)) {
                    attr.parse_nested_meta(|meta| column.parse(&meta))?;
                }
                if column.key && column.computed.is_some() {
                    return Err(syn::Error::new_spanned(attr, "a key column cannot be computed"));
                }
                Some(if column.skip { Self::Skip } else { Self::Column(column) })
            } else if attr.path().is_ident("relation") {
                let mut relation = RelationAttrs::default();
                attr.parse_nested_meta(|meta| relation.parse(&meta))?;
                if relation.local.is_none() || relation.remote.is_none() {
                    return Err(syn::Error::new_spanned(
                        attr,
                        "relation requires `local` and `remote` columns",
                    ));
                }
                Some(Self::Relation(relation))
            } else if attr.path().is_ident("join_left") {
                Some(Self::JoinLeft)
            } else if attr.path().is_ident("join_right") {
                Some(Self::JoinRight)
            } else {
                None
            };

            if let Some(parsed) = parsed {
                if kind.is_some() {
                    return Err(syn::Error::new_spanned(attr, "field already has a mapping attribute"));
                }
                kind = Some(parsed);
            }
        }

        Ok(kind.unwrap_or_else(|| Self::Column(ColumnAttrs::default())))
    }
}

// See https://docs.rs/syn/latest/syn/meta/fn.parser.html
impl ColumnAttrs {
    fn parse(&mut self, meta: &ParseNestedMeta) -> Result<()> {
        if meta.path.is_ident("name") {
            self.name = Some(meta.value()?.parse()?);
        } else if meta.path.is_ident("key") {
            self.key = true;
        } else if meta.path.is_ident("auto_increment") {
            self.auto_increment = true;
        } else if meta.path.is_ident("json") {
            self.json = true;
        } else if meta.path.is_ident("cas_version") {
            self.cas_version = true;
        } else if meta.path.is_ident("computed") {
            self.computed = Some(meta.value()?.parse()?);
        } else if meta.path.is_ident("insertable") {
            self.insertable = meta.value()?.parse::<LitBool>()?.value;
        } else if meta.path.is_ident("updatable") {
            self.updatable = meta.value()?.parse::<LitBool>()?.value;
        } else if meta.path.is_ident("skip") {
            self.skip = true;
        } else if meta.path.is_ident("soft_delete") {
            let span = meta.path.span();
            let mut normal = LitStr::new("0", span);
            let mut deleted = LitStr::new("1", span);
            if meta.input.peek(token::Paren) {
                meta.parse_nested_meta(|inner| {
                    if inner.path.is_ident("normal") {
                        normal = inner.value()?.parse()?;
                    } else if inner.path.is_ident("deleted") {
                        deleted = inner.value()?.parse()?;
                    } else {
                        return Err(inner.error("expected `normal` or `deleted`"));
                    }
                    Ok(())
                })?;
            }
            self.soft_delete = Some((normal, deleted));
        } else {
            return Err(meta.error("unsupported column property"));
        }

        Ok(())
    }
}

impl RelationAttrs {
    fn parse(&mut self, meta: &ParseNestedMeta) -> Result<()> {
        if meta.path.is_ident("local") {
            self.local = Some(meta.value()?.parse()?);
        } else if meta.path.is_ident("remote") {
            self.remote = Some(meta.value()?.parse()?);
        } else if meta.path.is_ident("extra_where") {
            self.extra_where = Some(meta.value()?.parse()?);
        } else if meta.path.is_ident("provider") {
            self.provider = Some(meta.value()?.parse()?);
        } else {
            return Err(meta.error("unsupported relation property"));
        }
        Ok(())
    }
}
