use proc_macro::TokenStream;

use quote::quote;
use syn::{Attribute, Expr, ExprLit, ItemStruct, Lit, Meta, Token, parse::Parser, spanned::Spanned};

/// Attaches a stable id and a human label to a transaction stage.
///
/// ```ignore
/// #[Stage(id = "verification.create_clone", label = "Create clone")]
/// pub struct CreateCloneStage { .. }
/// ```
///
/// Expands to `ID`/`LABEL` associated consts and an impl of
/// `crate::transaction::Named`, so stage structs only implement `commit`.
#[proc_macro_attribute]
#[allow(non_snake_case)]
pub fn Stage(attr: TokenStream, item: TokenStream) -> TokenStream {
    match stage_impl(attr, item) {
        Ok(ts) => ts,
        Err(e) => e.to_compile_error().into(),
    }
}

fn lit_str(expr: &Expr) -> syn::Result<String> {
    match expr {
        Expr::Lit(ExprLit {
            lit: Lit::Str(s), ..
        }) => Ok(s.value()),
        _ => Err(syn::Error::new(expr.span(), "expected string literal")),
    }
}

fn drop_our_attrs(attrs: &[Attribute]) -> Vec<Attribute> {
    attrs
        .iter()
        .filter(|a| {
            let Meta::Path(p) = &a.meta else {
                return true;
            };
            p.get_ident().map(|i| i != "Stage").unwrap_or(true)
        })
        .cloned()
        .collect()
}

fn valid_stage_id(id: &str) -> bool {
    !id.is_empty()
        && !id.starts_with('.')
        && !id.ends_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '_')
}

struct StageMeta {
    id: String,
    label: String,
}

fn parse_meta(attr: TokenStream, st: &ItemStruct) -> syn::Result<StageMeta> {
    let parser = syn::punctuated::Punctuated::<Meta, Token![,]>::parse_terminated;
    let metas = parser.parse(attr)?;

    let mut id: Option<(String, proc_macro2::Span)> = None;
    let mut label: Option<String> = None;

    for m in metas {
        let Meta::NameValue(nv) = m else {
            return Err(syn::Error::new(m.span(), "expected key = value"));
        };
        let Some(key) = nv.path.get_ident().map(|i| i.to_string()) else {
            return Err(syn::Error::new(nv.path.span(), "expected ident key"));
        };
        match key.as_str() {
            "id" => id = Some((lit_str(&nv.value)?, nv.value.span())),
            "label" => label = Some(lit_str(&nv.value)?),
            other => {
                return Err(syn::Error::new(
                    nv.path.span(),
                    format!("unknown Stage attribute key '{other}'"),
                ));
            }
        }
    }

    let (id, id_span) = id.ok_or_else(|| syn::Error::new(st.ident.span(), "Stage: missing id"))?;
    if !valid_stage_id(&id) {
        return Err(syn::Error::new(
            id_span,
            format!("Stage: invalid id '{id}' (allowed: a-z0-9._, dotted)"),
        ));
    }
    // Label defaults to the last id segment.
    let label = label.unwrap_or_else(|| id.rsplit('.').next().unwrap_or(&id).replace('_', " "));
    Ok(StageMeta { id, label })
}

fn stage_impl(attr: TokenStream, item: TokenStream) -> syn::Result<TokenStream> {
    let mut st: ItemStruct = syn::parse(item)?;
    st.attrs = drop_our_attrs(&st.attrs);
    let meta = parse_meta(attr, &st)?;

    let ident = st.ident.clone();
    let (impl_generics, ty_generics, where_clause) = st.generics.split_for_impl();
    let id_lit = meta.id;
    let label_lit = meta.label;

    let expanded = quote! {
        #st

        impl #impl_generics #ident #ty_generics #where_clause {
            pub const ID: &'static str = #id_lit;
            pub const LABEL: &'static str = #label_lit;
        }

        impl #impl_generics crate::transaction::Named for #ident #ty_generics #where_clause {
            fn id(&self) -> &'static str {
                #id_lit
            }

            fn label(&self) -> &'static str {
                #label_lit
            }
        }
    };

    Ok(expanded.into())
}
