use proc_macro::TokenStream;

use quote::quote;
use syn::{
    Attribute, Expr, ExprArray, ExprLit, ExprPath, ItemStruct, Lit, Meta, Token, parse::Parser,
    spanned::Spanned,
};

#[proc_macro_attribute]
#[allow(non_snake_case)]
pub fn Step(attr: TokenStream, item: TokenStream) -> TokenStream {
    match step_impl(attr, item) {
        Ok(ts) => ts,
        Err(e) => e.to_compile_error().into(),
    }
}

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

fn expr_array_strings(expr: &Expr) -> syn::Result<Vec<String>> {
    let Expr::Array(ExprArray { elems, .. }) = expr else {
        return Err(syn::Error::new(expr.span(), "expected array literal"));
    };
    elems.iter().map(lit_str).collect()
}

fn expr_path(expr: &Expr) -> syn::Result<syn::Path> {
    match expr {
        Expr::Path(ExprPath { path, .. }) => Ok(path.clone()),
        _ => Err(syn::Error::new(expr.span(), "expected path (identifier)")),
    }
}

fn expr_array_paths(expr: &Expr) -> syn::Result<Vec<syn::Path>> {
    let Expr::Array(ExprArray { elems, .. }) = expr else {
        return Err(syn::Error::new(expr.span(), "expected array literal"));
    };
    elems.iter().map(expr_path).collect()
}

fn drop_our_attrs(attrs: &[Attribute]) -> Vec<Attribute> {
    attrs
        .iter()
        .filter(|a| {
            let Some(ident) = a.path().get_ident() else {
                return true;
            };
            ident != "Step" && ident != "Stage"
        })
        .cloned()
        .collect()
}

fn parse_key_values(attr: TokenStream) -> syn::Result<Vec<(String, Expr, proc_macro2::Span)>> {
    let parser = syn::punctuated::Punctuated::<Meta, Token![,]>::parse_terminated;
    let metas = parser.parse(attr)?;
    let mut out = Vec::new();
    for m in metas {
        let Meta::NameValue(nv) = m else {
            return Err(syn::Error::new(m.span(), "expected key = value"));
        };
        let Some(key) = nv.path.get_ident().map(|i| i.to_string()) else {
            return Err(syn::Error::new(nv.path.span(), "expected ident key"));
        };
        out.push((key, nv.value, nv.path.span()));
    }
    Ok(out)
}

fn step_impl(attr: TokenStream, item: TokenStream) -> syn::Result<TokenStream> {
    let mut st: ItemStruct = syn::parse(item)?;
    st.attrs = drop_our_attrs(&st.attrs);
    let struct_ident = st.ident.clone();

    let mut id: Option<String> = None;
    let mut stage: Option<String> = None;
    let mut phase: Option<String> = None;
    let mut label: Option<String> = None;
    let mut provides: Vec<String> = Vec::new();
    let mut after: Vec<String> = Vec::new();
    let mut when: Option<syn::Path> = None;

    for (key, v, span) in parse_key_values(attr)? {
        match key.as_str() {
            "id" => id = Some(lit_str(&v)?),
            "stage" => stage = Some(lit_str(&v)?),
            "phase" => phase = Some(lit_str(&v)?),
            "label" => label = Some(lit_str(&v)?),
            "provides" => provides = expr_array_strings(&v)?,
            "after" => after = expr_array_strings(&v)?,
            "when" => when = Some(expr_path(&v)?),
            other => {
                return Err(syn::Error::new(
                    span,
                    format!("unknown Step attribute key '{other}'"),
                ));
            }
        }
    }

    let missing = |what: &str| syn::Error::new(struct_ident.span(), format!("Step: missing {what}"));
    let id = id.ok_or_else(|| missing("id"))?;
    let stage = stage.ok_or_else(|| missing("stage"))?;
    let phase = phase.ok_or_else(|| missing("phase"))?;
    let label = label.ok_or_else(|| missing("label"))?;
    if !id.starts_with(&format!("{stage}.")) {
        return Err(syn::Error::new(
            struct_ident.span(),
            "Step: id must start with '<stage>.'",
        ));
    }

    // A step with a `when` predicate is left out of the pipeline when it returns false.
    let when_check = match when {
        Some(pred) => quote! {
            if !#pred(session) {
                return Ok(());
            }
        },
        None => quote! {},
    };

    let expanded = quote! {
        #st

        impl #struct_ident {
            pub const ID: &'static str = #id;
            pub const STAGE: &'static str = #stage;
            pub const PHASE: &'static str = #phase;
            pub const LABEL: &'static str = #label;

            pub fn plan(
                session: &crate::session::InstallSession,
                pipeline: &mut crate::pipeline::Pipeline,
            ) -> crate::Result<()> {
                #when_check
                pipeline.add(crate::pipeline::Step {
                    id: #id.to_string(),
                    label: #label.to_string(),
                    stage: #stage.to_string(),
                    phase: #phase.to_string(),
                    after: vec![#(#after.to_string()),*],
                    provides: vec![#(#provides.to_string()),*],
                })
            }

            // Steps define their runtime behavior by implementing:
            // `fn run(session: &mut InstallSession, ctx: &mut ExecCtx) -> crate::Result<()>`
            pub fn exec(
                session: &mut crate::session::InstallSession,
                ctx: &mut crate::executor::ExecCtx,
            ) -> crate::Result<()> {
                Self::run(session, ctx)
            }
        }
    };

    Ok(expanded.into())
}

fn stage_impl(attr: TokenStream, item: TokenStream) -> syn::Result<TokenStream> {
    let mut st: ItemStruct = syn::parse(item)?;
    st.attrs = drop_our_attrs(&st.attrs);
    let struct_ident = st.ident.clone();

    let mut id: Option<String> = None;
    let mut steps: Option<Vec<syn::Path>> = None;

    for (key, v, span) in parse_key_values(attr)? {
        match key.as_str() {
            "id" => id = Some(lit_str(&v)?),
            "steps" => steps = Some(expr_array_paths(&v)?),
            other => {
                return Err(syn::Error::new(
                    span,
                    format!("unknown Stage attribute key '{other}'"),
                ));
            }
        }
    }

    let id = id.ok_or_else(|| syn::Error::new(struct_ident.span(), "Stage: missing id"))?;
    let steps = steps.ok_or_else(|| syn::Error::new(struct_ident.span(), "Stage: missing steps"))?;

    let plan_steps = steps.iter().map(|p| quote! { #p::plan(session, pipeline)?; });
    let reg_steps = steps.iter().map(|p| quote! { reg.add(#p::ID, #p::exec)?; });

    let expanded = quote! {
        #st

        impl crate::storage::Stage for #struct_ident {
            fn id(&self) -> &'static str {
                #id
            }

            fn plan(
                &self,
                session: &crate::session::InstallSession,
                pipeline: &mut crate::pipeline::Pipeline,
            ) -> crate::Result<()> {
                #(#plan_steps)*
                Ok(())
            }
        }

        impl crate::executor::StageExec for #struct_ident {
            fn register_steps(reg: &mut crate::executor::StepRegistry) -> crate::Result<()> {
                #(#reg_steps)*
                Ok(())
            }
        }
    };

    Ok(expanded.into())
}
