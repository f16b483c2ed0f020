use proc_macro::TokenStream;
use quote::quote;
use syn::{
    FnArg, Ident, ItemFn, Path, Result as SynResult, parse::Parse, parse::ParseStream,
    parse_macro_input, spanned::Spanned,
};

mod utils;

use utils::{parse_kv_pairs, pascal_case};

/// 处理器宏
/// - 作用于 `fn(&mut Exchange) -> anyhow::Result<()>`（同步或 async 均可）
/// - 保留原函数，并生成同名 PascalCase 单元结构体，为其实现 `::eip_core::processor::Processor`
/// - 支持参数：`#[processor(name = TypeName)]` 自定义结构体名
#[proc_macro_attribute]
pub fn processor(attr: TokenStream, item: TokenStream) -> TokenStream {
    let cfg = parse_macro_input!(attr as NameAttrConfig);
    let func = parse_macro_input!(item as ItemFn);

    if let Err(err) = check_arity(&func, 1, "#[processor]") {
        return err.to_compile_error().into();
    }

    let vis = &func.vis;
    let fn_name = &func.sig.ident;
    let ty_name = cfg.name.unwrap_or_else(|| pascal_case(fn_name));
    let call = if func.sig.asyncness.is_some() {
        quote! { #fn_name(exchange).await }
    } else {
        quote! { #fn_name(exchange) }
    };

    let expanded = quote! {
        #func

        #[derive(Debug, Clone, Copy, Default)]
        #vis struct #ty_name;

        #[::eip_core::async_trait]
        impl ::eip_core::processor::Processor for #ty_name {
            async fn process(
                &self,
                exchange: &mut ::eip_core::exchange::Exchange,
            ) -> ::anyhow::Result<()> {
                #call
            }
        }

        impl #ty_name {
            /// 以共享处理器形式返回
            #vis fn shared() -> ::eip_core::processor::SharedProcessor {
                ::std::sync::Arc::new(Self)
            }
        }
    };

    TokenStream::from(expanded)
}

/// 聚合策略宏
/// - 作用于 `fn(Option<Exchange>, Exchange) -> anyhow::Result<Exchange>`
/// - 保留原函数，并生成 PascalCase 单元结构体，为其实现 `::eip_core::aggregation::AggregationStrategy`
/// - 支持参数：
///   - `name = TypeName`：自定义结构体名
///   - `pre_complete = path::to_fn`：`fn(Option<&Exchange>, &Exchange) -> bool`，提供时启用提前完成
#[proc_macro_attribute]
pub fn aggregation_strategy(attr: TokenStream, item: TokenStream) -> TokenStream {
    let cfg = parse_macro_input!(attr as StrategyAttrConfig);
    let func = parse_macro_input!(item as ItemFn);

    if let Some(asyncness) = func.sig.asyncness {
        return syn::Error::new(
            asyncness.span(),
            "#[aggregation_strategy] requires a synchronous fn",
        )
        .to_compile_error()
        .into();
    }
    if let Err(err) = check_arity(&func, 2, "#[aggregation_strategy]") {
        return err.to_compile_error().into();
    }

    let vis = &func.vis;
    let fn_name = &func.sig.ident;
    let ty_name = cfg.name.unwrap_or_else(|| pascal_case(fn_name));

    let pre_complete = cfg.pre_complete.map(|path| {
        quote! {
            fn can_pre_complete(&self) -> bool {
                true
            }

            fn pre_complete(
                &self,
                old: ::core::option::Option<&::eip_core::exchange::Exchange>,
                new: &::eip_core::exchange::Exchange,
            ) -> bool {
                #path(old, new)
            }
        }
    });

    let expanded = quote! {
        #func

        #[derive(Debug, Clone, Copy, Default)]
        #vis struct #ty_name;

        impl ::eip_core::aggregation::AggregationStrategy for #ty_name {
            fn aggregate(
                &self,
                old: ::core::option::Option<::eip_core::exchange::Exchange>,
                new: ::eip_core::exchange::Exchange,
            ) -> ::anyhow::Result<::eip_core::exchange::Exchange> {
                #fn_name(old, new)
            }

            #pre_complete
        }

        impl #ty_name {
            /// 以共享策略形式返回
            #vis fn shared() -> ::eip_core::aggregation::SharedAggregationStrategy {
                ::std::sync::Arc::new(Self)
            }
        }
    };

    TokenStream::from(expanded)
}

// 校验函数形参个数且不含 self
fn check_arity(func: &ItemFn, expected: usize, macro_name: &str) -> SynResult<()> {
    if let Some(FnArg::Receiver(recv)) = func.sig.inputs.first() {
        return Err(syn::Error::new(
            recv.span(),
            format!("{macro_name} only on free functions"),
        ));
    }
    if func.sig.inputs.len() != expected {
        return Err(syn::Error::new(
            func.sig.inputs.span(),
            format!("{macro_name} expects exactly {expected} parameter(s)"),
        ));
    }
    if !func.sig.generics.params.is_empty() {
        return Err(syn::Error::new(
            func.sig.generics.span(),
            format!("{macro_name} does not support generic functions"),
        ));
    }
    Ok(())
}

// 解析 processor 宏参数：name = <Ident>
struct NameAttrConfig {
    name: Option<Ident>,
}

impl Parse for NameAttrConfig {
    fn parse(input: ParseStream) -> SynResult<Self> {
        let mut name = None;
        for kv in parse_kv_pairs(input, &["name"])? {
            name = Some(path_ident(&kv.value)?);
        }
        Ok(Self { name })
    }
}

// 解析 aggregation_strategy 宏参数：name = <Ident>、pre_complete = <Path>
struct StrategyAttrConfig {
    name: Option<Ident>,
    pre_complete: Option<Path>,
}

impl Parse for StrategyAttrConfig {
    fn parse(input: ParseStream) -> SynResult<Self> {
        let mut name = None;
        let mut pre_complete = None;
        for kv in parse_kv_pairs(input, &["name", "pre_complete"])? {
            match kv.key.to_string().as_str() {
                "name" => name = Some(path_ident(&kv.value)?),
                _ => pre_complete = Some(kv.value),
            }
        }
        Ok(Self { name, pre_complete })
    }
}

fn path_ident(path: &Path) -> SynResult<Ident> {
    path.get_ident()
        .cloned()
        .ok_or_else(|| syn::Error::new(path.span(), "expected a plain type name"))
}
